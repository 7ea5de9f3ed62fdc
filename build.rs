fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tell cargo to rerun this build script if the proto file changes.
    println!("cargo:rerun-if-changed=proto/google/pubsub/v1/pubsub.proto");
    println!("cargo:rerun-if-changed=proto");

    // The generated bindings are checked in under src/api/generated so the
    // crate builds in environments without `protoc`. Only regenerate them
    // when a protobuf compiler is actually available.
    let protoc_available = std::env::var_os("PROTOC")
        .map(std::path::PathBuf::from)
        .map(|p| p.exists())
        .unwrap_or(false)
        || which_protoc();
    if !protoc_available {
        println!(
            "cargo:warning=protoc not found; using checked-in generated protobuf bindings"
        );
        return Ok(());
    }

    // Compile the Pub/Sub Protocol Buffer definitions.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir("src/api/generated")
        .compile_protos(&["proto/google/pubsub/v1/pubsub.proto"], &["proto"])?;

    Ok(())
}

/// Best-effort check for a `protoc` binary on `PATH`.
fn which_protoc() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        dir.join("protoc").exists() || dir.join("protoc.exe").exists()
    })
}
