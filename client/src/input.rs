use anyhow::{anyhow, Context, Result};
use common::schema::{FieldType, TableSchema};
use common::Record;
use serde_json::{json, Map, Value};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

/* =========================
   Entrada de la demo: un archivo = una tarea
   ========================= */

/// Expande el patrón y devuelve solo archivos, ordenados para que el slot
/// de cada archivo sea estable entre corridas.
pub fn expand_input(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("patrón inválido: {pattern}"))? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `.csv` se lee con encabezados; cualquier otra extensión se trata como JSONL.
pub fn read_records(path: &Path, schema: &TableSchema) -> Result<Vec<Record>> {
    let is_csv = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if is_csv {
        read_csv(path, schema)
    } else {
        read_jsonl(path)
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Record>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: JSON inválido", path.display(), n + 1))?;
        out.push(rec);
    }
    Ok(out)
}

fn read_csv(path: &Path, schema: &TableSchema) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        // Limpia BOM por si viene de Excel/Windows
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut obj = Map::new();
        for (h, raw) in headers.iter().zip(row.iter()) {
            if raw.is_empty() {
                continue;
            }
            obj.insert(h.clone(), coerce(schema, h, raw)?);
        }
        out.push(Value::Object(obj));
    }
    Ok(out)
}

// CSV solo trae texto: se convierte según el tipo declarado de la columna
fn coerce(schema: &TableSchema, column: &str, raw: &str) -> Result<Value> {
    let field_type = schema
        .fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(column))
        .map(|f| f.field_type);

    let value = match field_type {
        Some(FieldType::Integer) => json!(raw
            .parse::<i64>()
            .map_err(|_| anyhow!("columna {column}: '{raw}' no es INTEGER"))?),
        Some(FieldType::Float) => json!(raw
            .parse::<f64>()
            .map_err(|_| anyhow!("columna {column}: '{raw}' no es FLOAT"))?),
        Some(FieldType::Boolean) => json!(raw
            .to_ascii_lowercase()
            .parse::<bool>()
            .map_err(|_| anyhow!("columna {column}: '{raw}' no es BOOLEAN"))?),
        _ => json!(raw),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, io::Write};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("client_input_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn schema() -> TableSchema {
        TableSchema::parse(
            r#"[{"name":"word","type":"STRING"},{"name":"count","type":"INTEGER"}]"#,
        )
        .unwrap()
    }

    #[test]
    fn csv_convierte_columnas_segun_el_esquema() {
        let dir = temp_dir("csv");
        let path = dir.join("words.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "\u{feff}word,count").unwrap();
        writeln!(f, "hola, 3").unwrap();
        writeln!(f, "mundo,").unwrap();

        let recs = read_records(&path, &schema()).unwrap();
        assert_eq!(
            recs,
            vec![json!({"word": "hola", "count": 3}), json!({"word": "mundo"})]
        );
    }

    #[test]
    fn csv_con_entero_invalido_falla() {
        let dir = temp_dir("csv_bad");
        let path = dir.join("bad.csv");
        fs::write(&path, "word,count\nhola,tres\n").unwrap();

        let err = read_records(&path, &schema()).unwrap_err();
        assert!(err.to_string().contains("INTEGER"));
    }

    #[test]
    fn jsonl_ignora_lineas_vacias() {
        let dir = temp_dir("jsonl");
        let path = dir.join("part.jsonl");
        fs::write(&path, "{\"word\":\"a\",\"count\":1}\n\n{\"word\":\"b\",\"count\":2}\n").unwrap();

        let recs = read_records(&path, &schema()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1]["word"], json!("b"));
    }

    #[test]
    fn expand_input_devuelve_solo_archivos_ordenados() {
        let dir = temp_dir("glob");
        fs::write(dir.join("b.jsonl"), "").unwrap();
        fs::write(dir.join("a.jsonl"), "").unwrap();
        fs::create_dir_all(dir.join("c.jsonl")).unwrap();

        let pattern = format!("{}/*.jsonl", dir.display());
        let files = expand_input(&pattern).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jsonl", "b.jsonl"]);
    }
}
