fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl targets: link the manually built static libraries, no pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        if std::env::var("CARGO_FEATURE_CELT").is_ok() {
            println!("cargo:rustc-link-lib=static=celt0");
        }
        return;
    }

    // Other targets: locate libspeexdsp (and libcelt when enabled) via pkg-config
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");

    if std::env::var("CARGO_FEATURE_CELT").is_ok() {
        pkg_config::Config::new()
            .probe("celt")
            .expect("Failed to find celt. Install libcelt-dev or disable the `celt` feature.");
    }
}
