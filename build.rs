fn main() {
    // Use semantic version from Cargo.toml
    let version = env!("CARGO_PKG_VERSION");

    // Compilation timestamp for the startup banner
    let timestamp = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();

    println!("cargo:rustc-env=BUILD_VERSION={}", version);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);
    println!("cargo:rerun-if-changed=build.rs");
}
