//! On-disk format of hierarchy extraction output
//!
//! The processor writes into the extraction output directory:
//!
//! ```text
//! fields.tsv          one row per field: name, display name, delimiter, structure
//! values/field_0.txt  values of the first row, one per line
//! values/field_1.txt  ...
//! ```

use std::path::{Path, PathBuf};

use crate::job::{ExtractedHierarchy, Field, StructureKind};

/// Name of the field list file
pub const FIELDS_FILE: &str = "fields.tsv";

/// Directory holding one values file per field
pub const VALUES_DIR: &str = "values";

/// Errors reading extraction output
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// A required file is absent
    #[error("extraction output missing: {0}")]
    Missing(PathBuf),

    /// A file exists but cannot be interpreted
    #[error("malformed extraction output in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Any other I/O failure
    #[error("failed to read extraction output {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Path of the values file for the field at `index`
pub fn values_file(output_dir: &Path, index: usize) -> PathBuf {
    output_dir.join(VALUES_DIR).join(format!("field_{index}.txt"))
}

/// Read extraction output into a hierarchy
pub async fn read_hierarchy(output_dir: &Path) -> Result<ExtractedHierarchy, OutputError> {
    let fields_path = output_dir.join(FIELDS_FILE);
    let fields_text = read_required(&fields_path).await?;

    let mut fields = Vec::new();
    for (line_no, line) in fields_text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 4 {
            return Err(OutputError::Malformed {
                path: fields_path.clone(),
                reason: format!(
                    "line {} has {} columns, expected 4",
                    line_no + 1,
                    columns.len()
                ),
            });
        }

        let name = columns[0].trim();
        if name.is_empty() {
            return Err(OutputError::Malformed {
                path: fields_path.clone(),
                reason: format!("line {} has an empty field name", line_no + 1),
            });
        }

        let values_path = values_file(output_dir, fields.len());
        let values_text = read_required(&values_path).await?;
        let values = values_text
            .lines()
            .map(|v| v.trim_end_matches('\r'))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();

        fields.push(Field {
            name: name.to_string(),
            display_name: columns[1].trim().to_string(),
            value_delimiter: columns[2].to_string(),
            structure_kind: StructureKind::parse_lenient(columns[3]),
            values,
        });
    }

    Ok(ExtractedHierarchy::new(fields))
}

/// Write a hierarchy in the extraction output format
pub async fn write_hierarchy(
    output_dir: &Path,
    hierarchy: &ExtractedHierarchy,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(output_dir.join(VALUES_DIR)).await?;

    let mut rows = String::new();
    for (index, field) in hierarchy.fields.iter().enumerate() {
        let structure = match field.structure_kind {
            StructureKind::Flat => "flat",
            StructureKind::Tree => "tree",
            StructureKind::Unknown => "unknown",
        };
        rows.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            field.name, field.display_name, field.value_delimiter, structure
        ));

        let mut values = field.values.join("\n");
        values.push('\n');
        tokio::fs::write(values_file(output_dir, index), values).await?;
    }

    tokio::fs::write(output_dir.join(FIELDS_FILE), rows).await
}

async fn read_required(path: &Path) -> Result<String, OutputError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(OutputError::Missing(path.to_path_buf()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(OutputError::Malformed {
            path: path.to_path_buf(),
            reason: "not valid UTF-8".to_string(),
        }),
        Err(source) => Err(OutputError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
