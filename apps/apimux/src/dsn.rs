use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SQLITE_SCHEME: &str = "sqlite:";

/// Turn the CLI/ENV inputs into a connectable DSN.
///
/// An empty DSN means "run self-contained": a sqlite database under the data
/// directory (itself defaulting to `./data`). Whatever sqlite file the DSN
/// ends up naming is created eagerly, because sqlx refuses to connect to a
/// path that does not exist yet.
pub(crate) fn resolve_dsn(input: &str, data_dir: &str) -> io::Result<String> {
    let dsn = match input.trim() {
        "" => sqlite_dsn(&default_db_path(data_dir)),
        explicit => explicit.to_string(),
    };
    if let Some(file) = sqlite_file_of(&dsn) {
        prepare_sqlite_file(&file)?;
    }
    Ok(dsn)
}

fn default_db_path(data_dir: &str) -> PathBuf {
    let base = match data_dir.trim() {
        "" => Path::new("./data"),
        dir => Path::new(dir),
    };
    base.join("db").join("apimux.db")
}

fn sqlite_dsn(path: &Path) -> String {
    let text = path.to_string_lossy();
    // Absolute paths need the extra slash after the scheme's authority part.
    match text.strip_prefix('/') {
        Some(absolute) => format!("{SQLITE_SCHEME}///{absolute}"),
        None => format!("{SQLITE_SCHEME}//{text}"),
    }
}

/// The on-disk file a sqlite DSN points at, if it points at one at all
/// (in-memory databases and non-sqlite DSNs yield nothing).
fn sqlite_file_of(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix(SQLITE_SCHEME)?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    if rest.starts_with(":memory:") || rest.starts_with("memory:") {
        return None;
    }
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() {
        return None;
    }
    Some(PathBuf::from(file))
}

fn prepare_sqlite_file(file: &Path) -> io::Result<()> {
    if let Some(parent) = file.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    if !file.exists() {
        fs::File::create(file)?;
    }
    Ok(())
}
