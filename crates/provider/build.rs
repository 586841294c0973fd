fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = "../../proto";
    let protos = [
        "../../proto/tfplugin6.proto",
        "../../proto/plugin.proto",
        "../../proto/health.proto",
    ];

    std::fs::create_dir_all("src/generated")?;

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto);
    }

    // Terraform core is the client; the provider only serves.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .out_dir("src/generated")
        .compile(&protos, &[proto_dir])?;

    Ok(())
}
