use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Environment variable naming the file that lists the current good set.
pub const GOOD_SET_VAR: &str = "BISECT_GOOD_SET";
/// Environment variable naming the file that lists the current bad set.
pub const BAD_SET_VAR: &str = "BISECT_BAD_SET";

/// A newline-delimited item list on disk, exported to child processes under `var`
/// for as long as the value lives. The file is deleted on drop.
#[derive(Debug)]
pub struct ScopedSetFile {
    var: &'static str,
    file: NamedTempFile,
}

impl ScopedSetFile {
    pub fn new(var: &'static str, items: &[String]) -> io::Result<Self> {
        let file = write_item_list(items)?;
        Ok(Self { var, file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn env_pair(&self) -> (String, String) {
        (
            self.var.to_string(),
            self.file.path().to_string_lossy().into_owned(),
        )
    }
}

/// Writes `items` one per line to a fresh temp file. Also used for file-args switching.
pub fn write_item_list(items: &[String]) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    for item in items {
        writeln!(file, "{item}")?;
    }
    file.flush()?;
    Ok(file)
}
