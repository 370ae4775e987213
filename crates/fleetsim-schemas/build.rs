// ---------------------------------------------------------------------------
// Build script for the schemas crate.
//
// Compiles `proto/fleet/v1/fleet.proto` into Rust modules with `tonic-build`.
// A vendored `protoc` is used so no system installation is required.
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&["proto/fleet/v1/fleet.proto"], &["proto"])?;
    Ok(())
}
