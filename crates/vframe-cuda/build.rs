use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-changed=build.rs");

    // Linux resolves the driver at runtime via dlopen; elsewhere link it.
    if cfg!(target_os = "windows") {
        let Ok(cuda_path) = env::var("CUDA_PATH") else {
            println!(
                "cargo:warning=CUDA_PATH is not set; expecting cuda.lib on the default link path"
            );
            println!("cargo:rustc-link-lib=dylib=cuda");
            return;
        };
        let cuda_lib_dir = PathBuf::from(cuda_path).join("lib").join("x64");
        if !cuda_lib_dir.exists() {
            panic!(
                "CUDA library directory not found at {}",
                cuda_lib_dir.display()
            );
        }
        println!("cargo:rustc-link-search=native={}", cuda_lib_dir.display());
        println!("cargo:rustc-link-lib=dylib=cuda");
    }
}
