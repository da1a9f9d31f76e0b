pub const HOMOLOGY_DISPLAY_VERSION: &str = env!("HOMOLOGY_DISPLAY_VERSION");
pub const HOMOLOGY_BUILD_N: &str = env!("HOMOLOGY_BUILD_N");
pub const SERVICE_NAME: &str = "assembly_homology";

pub fn version_cli_text() -> String {
    format!(
        "assembly-homology {}\nBuild {}\nSketch-based nearest genome search for workspace objects",
        HOMOLOGY_DISPLAY_VERSION, HOMOLOGY_BUILD_N
    )
}
