fn main() {
    #[cfg(feature = "esp32")]
    embuild::espidf::sysenv::output();

    // Last-Modified for the bundled assets; only changes when web/ does.
    let stamp = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    println!("cargo:rustc-env=GARAGE_BUILD_STAMP={stamp}");
    println!("cargo:rerun-if-changed=web");
    println!("cargo:rerun-if-changed=build.rs");
}
