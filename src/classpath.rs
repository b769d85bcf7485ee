use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use zip::ZipArchive;

use crate::classfile::{ClassFile, parse_class_bytes};

/// Source of class files, the seam between the hierarchy and the filesystem.
pub trait ClassProvider {
    /// Find a class by internal name, `None` when it is not present.
    fn find_class(&mut self, name: &str) -> Result<Option<ClassFile>>;
}

/// A classpath of directories and jar/zip archives.
///
/// Archive handles are owned here and released when the value drops, on both
/// success and failure paths.
pub struct ClassPath {
    entries: Vec<Entry>,
}

enum Entry {
    Directory(PathBuf),
    Archive {
        path: PathBuf,
        archive: ZipArchive<File>,
    },
}

impl ClassPath {
    /// Open a classpath from a colon- or semicolon-separated specification.
    pub fn open(spec: &str) -> Result<ClassPath> {
        let paths = spec
            .split(|separator| separator == ':' || separator == ';')
            .filter(|piece| !piece.is_empty())
            .map(PathBuf::from)
            .collect();
        ClassPath::from_paths(paths)
    }

    /// Open a classpath from explicit entry paths, in order.
    pub fn from_paths(paths: Vec<PathBuf>) -> Result<ClassPath> {
        let mut entries = Vec::new();
        for path in paths {
            if !path.exists() {
                anyhow::bail!("classpath entry not found: {}", path.display());
            }
            if path.is_dir() {
                entries.push(Entry::Directory(path));
            } else if is_archive_path(&path) {
                let file = File::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let archive = ZipArchive::new(file)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                entries.push(Entry::Archive { path, archive });
            } else {
                anyhow::bail!("unsupported classpath entry: {}", path.display());
            }
        }
        Ok(ClassPath { entries })
    }
}

impl ClassProvider for ClassPath {
    fn find_class(&mut self, name: &str) -> Result<Option<ClassFile>> {
        let file_name = format!("{name}.class");
        for entry in &mut self.entries {
            match entry {
                Entry::Directory(directory) => {
                    let path = directory.join(Path::new(&file_name));
                    if !path.is_file() {
                        continue;
                    }
                    let data = fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    let class = parse_class_bytes(&data)
                        .with_context(|| format!("failed to parse {}", path.display()))?;
                    return Ok(Some(class));
                }
                Entry::Archive { path, archive } => {
                    let mut member = match archive.by_name(&file_name) {
                        Ok(member) => member,
                        Err(_) => continue,
                    };
                    let mut data = Vec::new();
                    member.read_to_end(&mut data).with_context(|| {
                        format!("failed to read {}:{}", path.display(), file_name)
                    })?;
                    let class = parse_class_bytes(&data).with_context(|| {
                        format!("failed to parse {}:{}", path.display(), file_name)
                    })?;
                    return Ok(Some(class));
                }
            }
        }
        debug!(class = name, "class not found on classpath");
        Ok(None)
    }
}

/// In-memory provider for synthetic programs and tests.
#[derive(Default)]
pub struct MemoryProvider {
    classes: BTreeMap<String, ClassFile>,
}

impl MemoryProvider {
    pub fn add(&mut self, class: ClassFile) {
        self.classes.insert(class.name.clone(), class);
    }
}

impl ClassProvider for MemoryProvider {
    fn find_class(&mut self, name: &str) -> Result<Option<ClassFile>> {
        Ok(self.classes.get(name).cloned())
    }
}

fn is_archive_path(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| {
            extension.eq_ignore_ascii_case("jar") || extension.eq_ignore_ascii_case("zip")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn minimal_class_bytes(name: &str) -> Vec<u8> {
        let mut data: Vec<u8> = Vec::new();
        data.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&52u16.to_be_bytes());
        data.extend_from_slice(&5u16.to_be_bytes());
        data.push(1);
        data.extend_from_slice(&(name.len() as u16).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        data.push(1);
        let object = b"java/lang/Object";
        data.extend_from_slice(&(object.len() as u16).to_be_bytes());
        data.extend_from_slice(object);
        data.push(7);
        data.extend_from_slice(&1u16.to_be_bytes());
        data.push(7);
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&0x0021u16.to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data
    }

    #[test]
    fn finds_classes_in_directories() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let package_dir = temp_dir.path().join("com/example");
        fs::create_dir_all(&package_dir).expect("create package dir");
        fs::write(
            package_dir.join("Foo.class"),
            minimal_class_bytes("com/example/Foo"),
        )
        .expect("write class file");

        let mut classpath =
            ClassPath::from_paths(vec![temp_dir.path().to_path_buf()]).expect("open classpath");

        let found = classpath
            .find_class("com/example/Foo")
            .expect("lookup succeeds")
            .expect("class present");
        assert_eq!(found.name, "com/example/Foo");
        assert!(
            classpath
                .find_class("com/example/Missing")
                .expect("lookup succeeds")
                .is_none()
        );
    }

    #[test]
    fn finds_classes_in_jars() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let jar_path = temp_dir.path().join("app.jar");
        let file = File::create(&jar_path).expect("create jar");
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("com/example/Bar.class", SimpleFileOptions::default())
            .expect("start entry");
        writer
            .write_all(&minimal_class_bytes("com/example/Bar"))
            .expect("write entry");
        writer.finish().expect("finish jar");

        let mut classpath = ClassPath::from_paths(vec![jar_path]).expect("open classpath");

        let found = classpath
            .find_class("com/example/Bar")
            .expect("lookup succeeds")
            .expect("class present");
        assert_eq!(found.name, "com/example/Bar");
    }

    #[test]
    fn rejects_missing_entries() {
        let result = ClassPath::from_paths(vec![PathBuf::from("/does/not/exist")]);

        assert!(result.is_err());
    }

    #[test]
    fn splits_spec_on_both_separators() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let first = temp_dir.path().join("a");
        let second = temp_dir.path().join("b");
        fs::create_dir_all(&first).expect("create dir");
        fs::create_dir_all(&second).expect("create dir");
        let spec = format!("{}:{};{}", first.display(), second.display(), first.display());

        let classpath = ClassPath::open(&spec).expect("open classpath");

        assert_eq!(classpath.entries.len(), 3);
    }
}
