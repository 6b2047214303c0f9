//! Output file naming convention.
//!
//! Every generated file is named after a caller-chosen prefix path,
//! e.g. `out/cat` for the source image `in/cat.jpg`:
//!
//! - `{prefix}_{label}.png` for the first image of an output label
//! - `{prefix}_{label}_{n}.png` for the n-th further image of that label
//! - `{prefix}_vid.{ext}` for the copied side artifact

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extension of every persisted output image.
pub const IMAGE_EXTENSION: &str = "png";

/// Suffix appended to the prefix for the copied side artifact.
pub const SIDE_ARTIFACT_SUFFIX: &str = "vid";

/// Extension used for the side artifact when its source has none.
pub const DEFAULT_SIDE_ARTIFACT_EXTENSION: &str = "mp4";

/// Path of the `index`-th image (arrival order) emitted for `label`.
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use naturalis_core::naming::output_image_path;
///
/// let prefix = Path::new("out/cat");
/// assert_eq!(output_image_path(prefix, "face", 0), PathBuf::from("out/cat_face.png"));
/// assert_eq!(output_image_path(prefix, "face", 2), PathBuf::from("out/cat_face_2.png"));
/// ```
pub fn output_image_path(prefix: &Path, label: &str, index: usize) -> PathBuf {
    let mut name = suffixed(prefix, label);
    if index > 0 {
        name.push("_");
        name.push(index.to_string());
    }
    name.push(".");
    name.push(IMAGE_EXTENSION);
    PathBuf::from(name)
}

/// Path the side artifact at `source` is copied to.
///
/// Keeps the source's extension, falling back to `mp4`.
pub fn side_artifact_path(prefix: &Path, source: &Path) -> PathBuf {
    let mut name = suffixed(prefix, SIDE_ARTIFACT_SUFFIX);
    name.push(".");
    match source.extension() {
        Some(ext) => name.push(ext),
        None => name.push(DEFAULT_SIDE_ARTIFACT_EXTENSION),
    }
    PathBuf::from(name)
}

/// Output prefix for `source` inside `target_dir`: the source's file stem.
///
/// ```
/// use std::path::{Path, PathBuf};
/// use naturalis_core::naming::prefix_in_dir;
///
/// assert_eq!(
///     prefix_in_dir(Path::new("out"), Path::new("in/sketch.jpg")),
///     PathBuf::from("out/sketch"),
/// );
/// ```
pub fn prefix_in_dir(target_dir: &Path, source: &Path) -> PathBuf {
    match source.file_stem() {
        Some(stem) => target_dir.join(stem),
        None => target_dir.join(source),
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> OsString {
    let mut name = prefix.as_os_str().to_owned();
    name.push("_");
    name.push(suffix);
    name
}
