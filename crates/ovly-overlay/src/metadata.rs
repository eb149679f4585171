//! Repository-wide files and package metadata

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

pub const METADATA_XML: &str = "metadata.xml";

/// Write `content` to `path` through a temp file in the same directory
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write unless the file already holds exactly `content`. Returns true if written.
pub(crate) fn write_if_changed(path: &Path, content: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == content => Ok(false),
        _ => write_atomic(path, content).map(|_| true),
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `metadata.xml` carrying a long description
pub fn render_metadata_xml(description: &str) -> String {
    let text = description.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE pkgmetadata SYSTEM \"https://www.gentoo.org/dtd/metadata.dtd\">\n\
         <pkgmetadata>\n\
         \t<longdescription>{}</longdescription>\n\
         </pkgmetadata>\n",
        escape_xml(&text)
    )
}

/// `profiles/repo_name`, `profiles/categories` and `metadata/layout.conf`.
///
/// Categories already listed are kept.
pub fn write_profiles<'a>(
    overlay_dir: &Path,
    name: &str,
    categories: impl IntoIterator<Item = &'a str>,
    masters: &[String],
) -> Result<()> {
    let profiles = overlay_dir.join("profiles");
    write_if_changed(&profiles.join("repo_name"), format!("{}\n", name).as_bytes())?;

    let categories_file = profiles.join("categories");
    let mut all: BTreeSet<String> = match fs::read_to_string(&categories_file) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
        Err(e) => return Err(e.into()),
    };
    all.extend(categories.into_iter().map(str::to_string));
    let mut text = String::new();
    for category in &all {
        text.push_str(category);
        text.push('\n');
    }
    write_if_changed(&categories_file, text.as_bytes())?;

    let layout = format!(
        "masters = {}\nrepo-name = {}\nmanifest-hashes = SHA256 SHA512 WHIRLPOOL\n",
        masters.join(" "),
        name
    );
    write_if_changed(&overlay_dir.join("metadata/layout.conf"), layout.as_bytes())?;
    Ok(())
}

/// Copy `*.eclass` files from `eclass_dirs` into `<overlay>/eclass`
pub fn import_eclasses(overlay_dir: &Path, eclass_dirs: &[impl AsRef<Path>]) -> Result<usize> {
    let dest_dir = overlay_dir.join("eclass");
    let mut imported = 0;

    for dir in eclass_dirs {
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("eclass") {
                continue;
            }
            let file_name = match path.file_name() {
                Some(name) => name,
                None => continue,
            };
            if write_if_changed(&dest_dir.join(file_name), &fs::read(&path)?)? {
                imported += 1;
            }
        }
    }
    Ok(imported)
}
