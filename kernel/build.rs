//! Build script for the kernel executable.
//!
//! Responsible for setting the linker script and emitting build metadata
//! (`VERGEN_BUILD_*`/`VERGEN_CARGO_*`) consumed by `logging::init_logging`'s
//! startup banner.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rustc-link-arg=-T./kernel/link.ld");

    vergen::Emitter::default()
        .add_instructions(&vergen::BuildBuilder::all_build()?)?
        .add_instructions(&vergen::CargoBuilder::all_cargo()?)?
        .emit()?;
    Ok(())
}
