fn main() -> std::io::Result<()> {
    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(
            &[
                "proto/invocation.proto",
                "proto/smelt_event.proto",
                "proto/smelt_client.proto",
            ],
            &["proto"],
        )
}
