use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{CommitError, CommitResult};

static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("regex de nombre de campo"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Record,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    /// Sub-campos, sólo para RECORD.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

/// Schema de una tabla destino o de staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    /// Parsea el descriptor de schema de la configuración.
    /// Acepta `[{"name":..,"type":..}]` o `{"fields":[...]}`.
    pub fn parse(descriptor: &str) -> CommitResult<Self> {
        let value: Value = serde_json::from_str(descriptor)
            .map_err(|e| CommitError::Schema(format!("no es JSON válido: {e}")))?;

        let fields: Vec<FieldSchema> = match value {
            Value::Array(_) => serde_json::from_value(value),
            Value::Object(mut obj) => match obj.remove("fields") {
                Some(f) => serde_json::from_value(f),
                None => return Err(CommitError::Schema("falta la clave \"fields\"".into())),
            },
            _ => return Err(CommitError::Schema("se esperaba un arreglo de campos".into())),
        }
        .map_err(|e| CommitError::Schema(format!("campo mal formado: {e}")))?;

        let schema = TableSchema { fields };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> CommitResult<()> {
        if self.fields.is_empty() {
            return Err(CommitError::Schema("el schema no tiene campos".into()));
        }
        validate_level(&self.fields, "")
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "[]".to_string())
    }
}

fn validate_level(fields: &[FieldSchema], prefix: &str) -> CommitResult<()> {
    let mut seen = HashSet::new();

    for field in fields {
        let path = format!("{prefix}{}", field.name);

        if !FIELD_NAME.is_match(&field.name) {
            return Err(CommitError::Schema(format!(
                "nombre de campo inválido: {path:?}"
            )));
        }
        // los nombres no distinguen mayúsculas
        if !seen.insert(field.name.to_lowercase()) {
            return Err(CommitError::Schema(format!("campo duplicado: {path}")));
        }

        match field.field_type {
            FieldType::Record => {
                if field.fields.is_empty() {
                    return Err(CommitError::Schema(format!(
                        "el RECORD {path} no tiene sub-campos"
                    )));
                }
                validate_level(&field.fields, &format!("{path}."))?;
            }
            _ if !field.fields.is_empty() => {
                return Err(CommitError::Schema(format!(
                    "sólo un RECORD puede tener sub-campos ({path})"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_acepta_arreglo_de_campos() {
        let schema =
            TableSchema::parse(r#"[{"name":"word","type":"STRING"},{"name":"n","type":"INTEGER","mode":"REQUIRED"}]"#)
                .unwrap();

        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.fields[0].mode, FieldMode::Nullable);
        assert_eq!(schema.fields[1].field_type, FieldType::Integer);
        assert_eq!(schema.fields[1].mode, FieldMode::Required);
    }

    #[test]
    fn parse_acepta_objeto_con_fields_y_records_anidados() {
        let schema = TableSchema::parse(
            r#"{"fields":[{"name":"user","type":"RECORD","fields":[{"name":"id","type":"STRING"}]}]}"#,
        )
        .unwrap();

        assert_eq!(schema.fields[0].fields[0].name, "id");
    }

    #[test]
    fn parse_rechaza_schemas_invalidos() {
        let casos = [
            "no es json",
            "[]",
            "{}",
            "42",
            r#"[{"name":"","type":"STRING"}]"#,
            r#"[{"name":"a b","type":"STRING"}]"#,
            r#"[{"name":"x","type":"STRING"},{"name":"X","type":"INTEGER"}]"#,
            r#"[{"name":"x","type":"NUMERICO"}]"#,
            r#"[{"name":"r","type":"RECORD"}]"#,
            r#"[{"name":"s","type":"STRING","fields":[{"name":"a","type":"STRING"}]}]"#,
        ];

        for caso in casos {
            let err = TableSchema::parse(caso).unwrap_err();
            assert!(matches!(err, CommitError::Schema(_)), "caso {caso}: {err:?}");
        }
    }

    #[test]
    fn to_json_se_puede_volver_a_parsear() {
        let schema = TableSchema::parse(r#"[{"name":"word","type":"STRING"}]"#).unwrap();
        assert_eq!(TableSchema::parse(&schema.to_json()).unwrap(), schema);
    }
}
