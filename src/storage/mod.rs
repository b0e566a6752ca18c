mod layout;

pub use layout::{artifact_file_name, next_free_path, ArtifactDir, ArtifactLayout};
