//! 마이그레이션 카탈로그.
//!
//! 디렉토리에서 `<4자리 순번>_<설명>.sql` 파일을 찾아 순번 순서로 정렬하고,
//! 실행 전에 각 파일을 검증합니다. 검증 실패는 모두 치명적이며 어떤 SQL도
//! 실행되기 전에 전체 실행을 중단합니다.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::analyzer::MigrationAnalyzer;
use super::checksum::checksum;
use super::lexer::{split_statements, SplitEnd};
use super::models::{MetaStatus, Migration, MigrationMeta};
use crate::error::CatalogError;

/// 파일명 순번 자릿수로 표현할 수 있는 최대 순번
pub const MAX_SEQUENCE: u32 = 9999;

/// 검증을 통과한 순서 있는 마이그레이션 목록
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
    migrations: Vec<Migration>,
}

impl Catalog {
    /// 디렉토리에서 카탈로그 로드
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CatalogError::MissingDirectory(dir.to_path_buf()));
        }

        let analyzer = MigrationAnalyzer::new();
        let mut migrations = Vec::new();
        let mut sidecars: HashMap<String, PathBuf> = HashMap::new();

        for path in list_files(dir)? {
            let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if filename.starts_with('.') {
                continue;
            }

            match path.extension().and_then(|e| e.to_str()) {
                Some("sql") => {
                    let sequence = parse_file_name(filename).ok_or_else(|| {
                        CatalogError::InvalidFileName {
                            filename: filename.to_string(),
                        }
                    })?;
                    migrations.push(load_migration(&analyzer, &path, filename, sequence)?);
                }
                Some("toml") => {
                    let stem = filename.trim_end_matches(".toml").to_string();
                    sidecars.insert(stem, path.clone());
                }
                _ => debug!(filename, "마이그레이션이 아닌 파일 무시"),
            }
        }

        migrations.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.filename.cmp(&b.filename)));

        for pair in migrations.windows(2) {
            if pair[0].sequence == pair[1].sequence {
                return Err(CatalogError::DuplicateSequence {
                    sequence: pair[0].sequence,
                    first: pair[0].filename.clone(),
                    second: pair[1].filename.clone(),
                });
            }
        }

        attach_sidecars(&mut migrations, sidecars)?;

        info!(
            dir = %dir.display(),
            count = migrations.len(),
            "마이그레이션 카탈로그 로드 완료"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            migrations,
        })
    }

    /// 순번 오름차순 마이그레이션 목록
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// 파일명으로 조회
    pub fn get(&self, filename: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.filename == filename)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// 다음 순번
    pub fn next_sequence(&self) -> u32 {
        self.migrations.last().map(|m| m.sequence + 1).unwrap_or(1)
    }
}

/// 새 마이그레이션 파일 생성 (`migrate new`).
///
/// 디렉토리의 파일명만 보고 다음 순번을 정하므로, 아직 내용이 없는
/// 파일이 있어도 동작합니다. 기존 파일은 절대 덮어쓰지 않습니다.
pub fn scaffold(dir: impl AsRef<Path>, description: &str) -> Result<PathBuf, CatalogError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(CatalogError::MissingDirectory(dir.to_path_buf()));
    }

    let slug = slugify(description);
    if slug.is_empty() {
        return Err(CatalogError::InvalidFileName {
            filename: description.to_string(),
        });
    }

    let last = list_files(dir)?
        .iter()
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()))
        .filter_map(|name| parse_file_name(name).map(|seq| (seq, name.to_string())))
        .max();
    let next = match last {
        Some((seq, name)) if seq >= MAX_SEQUENCE => {
            return Err(CatalogError::SequenceExhausted {
                last: name,
                max: MAX_SEQUENCE,
            });
        }
        Some((seq, _)) => seq + 1,
        None => 1,
    };

    let filename = format!("{:04}_{}.sql", next, slug);
    let path = dir.join(&filename);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|source| CatalogError::Write {
            path: path.clone(),
            source,
        })?;
    let header = format!(
        "-- {}\n-- Created: {}\n--\n-- Forward-only: never edit this file after it has been applied.\n\n",
        description.trim(),
        chrono::Utc::now().format("%Y-%m-%d")
    );
    file.write_all(header.as_bytes())
        .map_err(|source| CatalogError::Write {
            path: path.clone(),
            source,
        })?;

    info!(filename = %filename, "새 마이그레이션 파일 생성");
    Ok(path)
}

/// `0014_comprehensive_column_additions.sql` → Some(14)
pub fn parse_file_name(filename: &str) -> Option<u32> {
    let stem = filename.strip_suffix(".sql")?;
    if stem.len() < 4 || !stem.is_char_boundary(4) {
        return None;
    }
    let (digits, description) = stem.split_at(4);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let description = description.strip_prefix('_')?;
    let valid = !description.is_empty()
        && description
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return None;
    }
    digits.parse().ok()
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let entries = fs::read_dir(dir).map_err(|source| CatalogError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_migration(
    analyzer: &MigrationAnalyzer,
    path: &Path,
    filename: &str,
    sequence: u32,
) -> Result<Migration, CatalogError> {
    let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let split = split_statements(&content);
    match split.end {
        SplitEnd::Clean => {}
        SplitEnd::Fragment { line, tail } => {
            return Err(CatalogError::Truncated {
                filename: filename.to_string(),
                line,
                tail,
            })
        }
        SplitEnd::DollarQuote { tag, line } => {
            return Err(CatalogError::UnbalancedDollarQuote {
                filename: filename.to_string(),
                tag,
                line,
            })
        }
        SplitEnd::Unterminated { kind, line } => {
            return Err(CatalogError::UnterminatedLiteral {
                filename: filename.to_string(),
                kind,
                line,
            })
        }
    }

    // 주석만 있는 파일도 빈 파일로 간주
    if split.statements.is_empty() {
        return Err(CatalogError::Empty {
            filename: filename.to_string(),
        });
    }

    let statements = split.statements.iter().map(|raw| analyzer.analyze(raw)).collect();
    let name = filename.trim_end_matches(".sql").to_string();

    Ok(Migration {
        path: path.to_path_buf(),
        filename: filename.to_string(),
        name,
        sequence,
        checksum: checksum(&content),
        content,
        statements,
        meta: MigrationMeta::default(),
    })
}

fn attach_sidecars(
    migrations: &mut [Migration],
    mut sidecars: HashMap<String, PathBuf>,
) -> Result<(), CatalogError> {
    for migration in migrations.iter_mut() {
        let Some(path) = sidecars.remove(&migration.name) else {
            continue;
        };
        let sidecar_name = format!("{}.toml", migration.name);
        let text = fs::read_to_string(&path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;
        migration.meta = toml::from_str(&text).map_err(|e| CatalogError::Metadata {
            filename: sidecar_name.clone(),
            message: e.message().to_string(),
        })?;
    }

    // 짝이 없는 사이드카는 오타이거나 삭제된 마이그레이션의 잔재
    if let Some(stem) = sidecars.keys().min() {
        return Err(CatalogError::Metadata {
            filename: format!("{}.toml", stem),
            message: format!("no migration file named '{}.sql'", stem),
        });
    }

    let names: Vec<String> = migrations.iter().map(|m| m.name.clone()).collect();
    for migration in migrations.iter() {
        if migration.meta.status != MetaStatus::Superseded {
            continue;
        }
        let Some(target) = migration.meta.superseded_by.as_deref() else {
            return Err(CatalogError::Metadata {
                filename: format!("{}.toml", migration.name),
                message: "status 'superseded' requires 'superseded_by'".to_string(),
            });
        };
        let target_stem = target.trim_end_matches(".sql");
        if !names.iter().any(|n| n == target_stem) {
            return Err(CatalogError::Metadata {
                filename: format!("{}.toml", migration.name),
                message: format!("superseded_by names unknown migration '{}'", target),
            });
        }
    }

    Ok(())
}

fn slugify(description: &str) -> String {
    let mut slug = String::new();
    for c in description.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("0001_create_users.sql"), Some(1));
        assert_eq!(parse_file_name("0014_comprehensive-column_additions.sql"), Some(14));
        assert_eq!(parse_file_name("01_core.sql"), None);
        assert_eq!(parse_file_name("0001create.sql"), None);
        assert_eq!(parse_file_name("0001_.sql"), None);
        assert_eq!(parse_file_name("0001_has space.sql"), None);
        assert_eq!(parse_file_name("0001_users.txt"), None);
    }

    #[test]
    fn test_load_sorts_by_sequence() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0010_posts.sql", "CREATE TABLE posts (id INT);");
        write(&dir, "0002_users.sql", "CREATE TABLE users (id INT);");
        write(&dir, "README.md", "notes");

        let catalog = Catalog::load(dir.path()).unwrap();
        let names: Vec<_> = catalog.migrations().iter().map(|m| m.sequence).collect();
        assert_eq!(names, vec![2, 10]);
        assert_eq!(catalog.next_sequence(), 11);
        assert_eq!(catalog.get("0002_users.sql").unwrap().statements.len(), 1);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = Catalog::load(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, CatalogError::MissingDirectory(_)));
    }

    #[test]
    fn test_rejects_corrupt_files() {
        let cases: [(&str, fn(&CatalogError) -> bool); 4] = [
            ("", |e| matches!(e, CatalogError::Empty { .. })),
            ("-- only a comment\n", |e| matches!(e, CatalogError::Empty { .. })),
            (
                "DO $$ BEGIN\n  IF NOT EXISTS (SELECT 1 FROM informat",
                |e| matches!(e, CatalogError::UnbalancedDollarQuote { .. }),
            ),
            (
                "CREATE TABLE a (id INT);\nALTER TABLE a ADD COLUMN b TEXT",
                |e| matches!(e, CatalogError::Truncated { line: 2, .. }),
            ),
        ];

        for (content, check) in cases {
            let dir = TempDir::new().unwrap();
            write(&dir, "0001_ok.sql", "CREATE TABLE ok (id INT);");
            write(&dir, "0002_corrupt.sql", content);
            let err = Catalog::load(dir.path()).unwrap_err();
            assert!(check(&err), "unexpected error for {content:?}: {err}");
            assert_eq!(err.filename(), Some("0002_corrupt.sql"));
        }
    }

    #[test]
    fn test_rejects_invalid_name_and_duplicates() {
        let dir = TempDir::new().unwrap();
        write(&dir, "01_core.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()).unwrap_err(),
            CatalogError::InvalidFileName { .. }
        ));

        let dir = TempDir::new().unwrap();
        write(&dir, "0003_a.sql", "SELECT 1;");
        write(&dir, "0003_b.sql", "SELECT 2;");
        match Catalog::load(dir.path()).unwrap_err() {
            CatalogError::DuplicateSequence { sequence, first, second } => {
                assert_eq!(sequence, 3);
                assert_eq!(first, "0003_a.sql");
                assert_eq!(second, "0003_b.sql");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_sidecar_metadata() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0013_add_columns.sql", "ALTER TABLE posts ADD COLUMN x TEXT;");
        write(&dir, "0014_add_columns_fixed.sql", "ALTER TABLE posts ADD COLUMN IF NOT EXISTS x TEXT;");
        write(
            &dir,
            "0013_add_columns.toml",
            "status = \"superseded\"\nsuperseded_by = \"0014_add_columns_fixed\"\nreason = \"not idempotent\"\n",
        );

        let catalog = Catalog::load(dir.path()).unwrap();
        let m = catalog.get("0013_add_columns.sql").unwrap();
        assert_eq!(m.meta.status, MetaStatus::Superseded);
        assert!(m.meta.is_skipped());
        assert!(!catalog.get("0014_add_columns_fixed.sql").unwrap().meta.is_skipped());
    }

    #[test]
    fn test_sidecar_errors() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "SELECT 1;");
        write(&dir, "0002_gone.toml", "status = \"disabled\"\n");
        let err = Catalog::load(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Metadata { .. }));
        assert_eq!(err.filename(), Some("0002_gone.toml"));

        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "SELECT 1;");
        write(&dir, "0001_a.toml", "status = \"superseded\"\n");
        assert!(matches!(
            Catalog::load(dir.path()).unwrap_err(),
            CatalogError::Metadata { .. }
        ));

        let dir = TempDir::new().unwrap();
        write(&dir, "0001_a.sql", "SELECT 1;");
        write(&dir, "0001_a.toml", "status = \"paused\"\n");
        assert!(matches!(
            Catalog::load(dir.path()).unwrap_err(),
            CatalogError::Metadata { .. }
        ));
    }

    #[test]
    fn test_scaffold_next_sequence() {
        let dir = TempDir::new().unwrap();
        write(&dir, "0007_posts.sql", "CREATE TABLE posts (id INT);");

        let path = scaffold(dir.path(), "Add email unique!").unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "0008_add_email_unique.sql"
        );
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("-- Add email unique!"));

        // 내용이 비어 있는 파일이 있어도 다음 순번 계산
        let next = scaffold(dir.path(), "second").unwrap();
        assert!(next.ends_with("0009_second.sql"));
        assert!(scaffold(dir.path(), "???").is_err());
    }

    #[test]
    fn test_scaffold_refuses_sequence_past_four_digits() {
        let dir = TempDir::new().unwrap();
        write(&dir, "9998_almost.sql", "SELECT 1;");

        let path = scaffold(dir.path(), "last one").unwrap();
        assert!(path.ends_with("9999_last_one.sql"));
        assert_eq!(parse_file_name("9999_last_one.sql"), Some(9999));

        let err = scaffold(dir.path(), "overflow").unwrap_err();
        assert!(matches!(
            &err,
            CatalogError::SequenceExhausted { last, max: 9999 } if last == "9999_last_one.sql"
        ));
        assert!(!dir.path().join("10000_overflow.sql").exists());

        // 스스로 만든 파일 때문에 로드가 실패하지 않음
        write(&dir, "9999_last_one.sql", "SELECT 2;");
        assert_eq!(Catalog::load(dir.path()).unwrap().len(), 2);
    }
}
