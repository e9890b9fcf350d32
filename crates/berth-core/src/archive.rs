//! Chart archive (`.tgz`) packing and unpacking
//!
//! Archives hold a single top-level directory named after the chart, the
//! same layout chart repositories and registries serve.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, Header};

use crate::chart::LoadedChart;
use crate::error::{CoreError, Result};

/// Read every file of an archive, stripping the top-level directory
pub fn read_archive(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.into_owned();
        let relative = strip_top_level(&path)?;
        if relative.is_empty() {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(relative, data);
    }

    if files.is_empty() {
        return Err(CoreError::Archive {
            message: "archive contains no files".to_string(),
        });
    }

    Ok(files)
}

/// Unpack archive bytes into `dest`, stripping the top-level directory
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<()> {
    for (relative, content) in read_archive(bytes)? {
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}

/// Write a chart, subcharts included, as a `.tgz` archive
pub fn create_archive(chart: &LoadedChart, output: &Path) -> Result<PathBuf> {
    let file = File::create(output)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    append_chart(&mut builder, chart, chart.name())?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;

    Ok(output.to_path_buf())
}

/// Archive file name for a chart (`name-version.tgz`)
#[must_use]
pub fn archive_name(name: &str, version: &semver::Version) -> String {
    format!("{}-{}.tgz", name, version)
}

fn append_chart<W: Write>(builder: &mut Builder<W>, chart: &LoadedChart, prefix: &str) -> Result<()> {
    for (path, content) in &chart.files {
        add_bytes_to_archive(builder, &format!("{}/{}", prefix, path), content)?;
    }
    for sub in &chart.dependencies {
        append_chart(builder, sub, &format!("{}/charts/{}", prefix, sub.name()))?;
    }
    Ok(())
}

fn add_bytes_to_archive<W: Write>(
    builder: &mut Builder<W>,
    archive_path: &str,
    content: &[u8],
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();

    builder.append_data(&mut header, archive_path, content)?;

    Ok(())
}

fn strip_top_level(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(CoreError::Archive {
                    message: format!("unsafe path in archive: {}", path.display()),
                });
            }
        }
    }
    Ok(parts.into_iter().skip(1).collect::<Vec<_>>().join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chart(dir: &Path) {
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        std::fs::write(dir.join("Chart.yaml"), "apiVersion: v2\nname: demo\nversion: 0.3.1\n").unwrap();
        std::fs::write(dir.join("values.yaml"), "replicas: 3\n").unwrap();
        std::fs::write(dir.join("templates/svc.yaml"), "kind: Service\n").unwrap();
    }

    #[test]
    fn test_create_then_load() {
        let src = TempDir::new().unwrap();
        write_chart(src.path());
        let chart = LoadedChart::load(src.path()).unwrap();

        let out = TempDir::new().unwrap();
        let path = out.path().join(archive_name(chart.name(), &chart.metadata.version));
        create_archive(&chart, &path).unwrap();
        assert!(path.ends_with("demo-0.3.1.tgz"));

        let reloaded = LoadedChart::load(&path).unwrap();
        assert_eq!(reloaded.name(), "demo");
        assert_eq!(reloaded.values.get("replicas").unwrap(), 3);
        assert!(reloaded.files.contains_key("templates/svc.yaml"));
        assert!(reloaded.root.is_none());
    }

    #[test]
    fn test_extract_archive() {
        let src = TempDir::new().unwrap();
        write_chart(src.path());
        let chart = LoadedChart::load(src.path()).unwrap();
        let out = TempDir::new().unwrap();
        let path = out.path().join("demo.tgz");
        create_archive(&chart, &path).unwrap();

        let dest = TempDir::new().unwrap();
        extract_archive(&std::fs::read(&path).unwrap(), dest.path()).unwrap();
        assert!(dest.path().join("Chart.yaml").exists());
        assert!(dest.path().join("templates/svc.yaml").exists());
    }

    #[test]
    fn test_garbage_bytes_fail() {
        assert!(read_archive(b"not a tarball").is_err());
    }

    #[test]
    fn test_strip_top_level_rejects_parent_dirs() {
        assert_eq!(strip_top_level(Path::new("demo/templates/a.yaml")).unwrap(), "templates/a.yaml");
        assert!(strip_top_level(Path::new("demo/../../etc/passwd")).is_err());
    }
}
