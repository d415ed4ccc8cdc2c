use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_HIP").is_some() {
        println!("cargo:rustc-link-lib=amdhip64");
        if let Some(rocm) = env::var_os("ROCM_PATH") {
            println!("cargo:rustc-link-search=native={}/lib", rocm.to_string_lossy());
        }
    }

    #[cfg(feature = "verbs")]
    verbs::build();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env;
    use std::path::PathBuf;

    pub(super) fn build() {
        println!("You need to have librdmacm and libibverbs installed in your system.");
        println!("cargo:rerun-if-changed=src/verbs_wrapper.h");
        println!("cargo:rerun-if-changed=src/verbs_wrapper.c");
        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=rdmacm");

        cc::Build::new()
            .warnings(true)
            .opt_level(3)
            .file("src/verbs_wrapper.c")
            .compile("rdma_base_verbs_wrapper");

        let bindings = bindgen::Builder::default()
            .header("src/verbs_wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .allowlist_function("rdma_.*")
            .allowlist_function("ibv_.*")
            .allowlist_type("rdma_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("sockaddr.*")
            .allowlist_var("AF_INET.*")
            .blocklist_type("max_align_t")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_wc_flags")
            .bitfield_enum("ibv_send_flags")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_wr_opcode")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("rdma_port_space")
            .constified_enum_module("rdma_cm_event_type")
            .derive_default(true)
            .derive_debug(true)
            .generate()
            .expect("Unable to generate bindings");

        // Write the bindings to the $OUT_DIR/bindings.rs file.
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");
    }
}
