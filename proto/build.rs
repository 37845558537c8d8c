fn main() {
    let proto_files = &["../protos/measurement.proto"];
    let include_dirs = &["../protos"];

    // The generated module is checked in under src/generated, so a missing
    // protoc only skips regeneration.
    if let Err(e) = prost_build::Config::new()
        .out_dir("src/generated")
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(proto_files, include_dirs)
    {
        println!("cargo:warning=protobuf regeneration skipped: {e}");
    }

    for file in proto_files {
        println!("cargo:rerun-if-changed={file}");
    }
}
