use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::{
    CopyRequest, CopyResponse, CreateTableRequest, ErrorBody, ListTablesResponse, RowsPayload,
    SetLabelRequest,
};
use crate::error::{StoreError, StoreResult};
use crate::locator::{DatasetLocator, TableLocator};
use crate::schema::TableSchema;
use crate::store::{Record, TableInfo, TableStore};

/// Cliente del servicio `tablestore`.
#[derive(Debug, Clone)]
pub struct HttpTableStore {
    client: Client,
    base_url: String,
}

impl HttpTableStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn dataset_url(&self, d: &DatasetLocator) -> String {
        format!(
            "{}/api/v1/projects/{}/datasets/{}",
            self.base_url, d.project, d.dataset
        )
    }

    fn table_url(&self, t: &TableLocator) -> String {
        format!("{}/tables/{}", self.dataset_url(&t.dataset_locator()), t.table)
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("error HTTP: {e}"))
}

/// Convierte una respuesta no exitosa en el `StoreError` correspondiente.
async fn check(resp: Response) -> StoreResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return Err(body.into());
    }

    let message = format!("status {status}: {text}");
    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::AlreadyExists(message),
        s if s.is_server_error() => StoreError::Unavailable(message),
        _ => StoreError::Rejected(message),
    })
}

async fn json<T: DeserializeOwned>(resp: Response) -> StoreResult<T> {
    check(resp).await?.json().await.map_err(transport)
}

#[async_trait]
impl TableStore for HttpTableStore {
    async fn create_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()> {
        let resp = self
            .client
            .post(self.dataset_url(dataset))
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    async fn delete_dataset(&self, dataset: &DatasetLocator) -> StoreResult<()> {
        let resp = self
            .client
            .delete(self.dataset_url(dataset))
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    async fn list_tables(&self, dataset: &DatasetLocator) -> StoreResult<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/tables", self.dataset_url(dataset)))
            .send()
            .await
            .map_err(transport)?;
        let body: ListTablesResponse = json(resp).await?;
        Ok(body.tables)
    }

    async fn create_table(&self, table: &TableLocator, schema: &TableSchema) -> StoreResult<()> {
        let resp = self
            .client
            .post(self.table_url(table))
            .json(&CreateTableRequest {
                schema: schema.clone(),
            })
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    async fn get_table(&self, table: &TableLocator) -> StoreResult<TableInfo> {
        let resp = self
            .client
            .get(self.table_url(table))
            .send()
            .await
            .map_err(transport)?;
        json(resp).await
    }

    async fn insert_rows(&self, table: &TableLocator, rows: &[Record]) -> StoreResult<()> {
        let resp = self
            .client
            .post(format!("{}/rows", self.table_url(table)))
            .json(&RowsPayload {
                rows: rows.to_vec(),
            })
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    async fn read_rows(&self, table: &TableLocator) -> StoreResult<Vec<Record>> {
        let resp = self
            .client
            .get(format!("{}/rows", self.table_url(table)))
            .send()
            .await
            .map_err(transport)?;
        let body: RowsPayload = json(resp).await?;
        Ok(body.rows)
    }

    async fn set_label(&self, table: &TableLocator, key: &str, value: &str) -> StoreResult<()> {
        let resp = self
            .client
            .post(format!("{}/labels", self.table_url(table)))
            .json(&SetLabelRequest {
                key: key.to_string(),
                value: value.to_string(),
            })
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    async fn append_table(
        &self,
        source: &TableLocator,
        destination: &TableLocator,
        copy_id: &str,
    ) -> StoreResult<String> {
        let resp = self
            .client
            .post(format!("{}/api/v1/copy", self.base_url))
            .json(&CopyRequest {
                source: source.clone(),
                destination: destination.clone(),
                copy_id: copy_id.to_string(),
            })
            .send()
            .await
            .map_err(transport)?;
        let body: CopyResponse = json(resp).await?;
        Ok(body.job_id)
    }

    async fn delete_table(&self, table: &TableLocator) -> StoreResult<()> {
        let resp = self
            .client
            .delete(self.table_url(table))
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ErrorKind;

    fn response(status: u16, body: &str) -> Response {
        http::Response::builder()
            .status(status)
            .body(body.to_string())
            .unwrap()
            .into()
    }

    async fn error_for(status: u16, body: &str) -> StoreError {
        check(response(status, body)).await.unwrap_err()
    }

    #[tokio::test]
    async fn check_mapea_status_sin_cuerpo_json() {
        assert!(check(response(200, "")).await.is_ok());
        assert!(matches!(error_for(404, "no existe").await, StoreError::NotFound(_)));
        assert!(matches!(error_for(409, "ya existe").await, StoreError::AlreadyExists(_)));
        assert!(matches!(error_for(400, "mal").await, StoreError::Rejected(_)));
        assert!(matches!(error_for(422, "").await, StoreError::Rejected(_)));
        assert!(matches!(error_for(503, "<html>caído</html>").await, StoreError::Unavailable(_)));
        assert!(matches!(error_for(500, "").await, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn check_prefiere_el_error_body_al_status() {
        let body = serde_json::to_string(&ErrorBody {
            kind: ErrorKind::NotFound,
            message: "tabla p:d.t".into(),
        })
        .unwrap();

        match error_for(500, &body).await {
            StoreError::NotFound(m) => assert_eq!(m, "tabla p:d.t"),
            other => panic!("se esperaba NotFound, vino {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_conserva_el_texto_de_un_cuerpo_no_json() {
        match error_for(404, "sin ruta").await {
            StoreError::NotFound(m) => {
                assert!(m.contains("404"));
                assert!(m.contains("sin ruta"));
            }
            other => panic!("se esperaba NotFound, vino {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_de_conexion_es_unavailable() {
        // nadie escucha en el puerto 1
        let store = HttpTableStore::new("http://127.0.0.1:1/");
        let dataset = DatasetLocator {
            project: "p".into(),
            dataset: "d".into(),
        };

        assert!(matches!(
            store.create_dataset(&dataset).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
