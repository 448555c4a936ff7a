// Build script for gRPC code generation

fn main() {
    // Use vendored protoc from protobuf-src
    std::env::set_var("PROTOC", protobuf_src::protoc());

    compile_protos();
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");
}

fn compile_protos() {
    let well_known = protobuf_src::include();

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                std::path::Path::new("proto/rpc/v1/auth.proto"),
                std::path::Path::new("proto/rpc/webrtc/v1/grpc.proto"),
                std::path::Path::new("proto/rpc/webrtc/v1/signaling.proto"),
            ],
            &[std::path::Path::new("proto"), well_known.as_path()],
        )
        .unwrap_or_else(|e| panic!("Failed to compile protos: {}", e));
}
