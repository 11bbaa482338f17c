//! Build script for proto compilation.
//!
//! The generated code is committed to the repository, so this only needs
//! to run when one of the proto files changes.
//!
//! To regenerate: `cargo build --features regenerate-proto`
//!
//! The generated files are placed in `src/generated/` (`tfplugin5.rs` for the
//! provider protocol, `plugin.rs` for the go-plugin controller).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only regenerate if the feature is enabled
    #[cfg(feature = "regenerate-proto")]
    {
        let out_dir = std::path::PathBuf::from("src/generated");
        tonic_prost_build::configure()
            .build_client(false)
            .out_dir(&out_dir)
            .compile_protos(
                &["proto/tfplugin5.proto", "proto/grpc_controller.proto"],
                &["proto"],
            )?;
    }

    println!("cargo:rerun-if-changed=proto/tfplugin5.proto");
    println!("cargo:rerun-if-changed=proto/grpc_controller.proto");

    Ok(())
}
