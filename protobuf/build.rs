fn main() {
    println!("cargo:rerun-if-changed=./worker.proto");
    tonic_build::compile_protos("./worker.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
