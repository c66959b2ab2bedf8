fn main() {
    println!("cargo:rerun-if-changed=proto/portal.proto");

    // protox compiles the proto without an external protoc binary.
    let file_descriptors =
        protox::compile(["proto/portal.proto"], ["proto"]).expect("failed to compile portal.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(file_descriptors)
        .expect("failed to generate portal gRPC code");
}
