use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    api::{
        CopyRequest, CopyResponse, CreateTableRequest, ErrorBody, ListTablesResponse, RowsPayload,
        SetLabelRequest,
    },
    memory::StoreOp,
    DatasetLocator, StoreError, TableInfo, TableLocator, TableStore,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/projects/:project/datasets/:dataset",
            post(create_dataset).delete(delete_dataset),
        )
        .route(
            "/api/v1/projects/:project/datasets/:dataset/tables",
            get(list_tables),
        )
        .route(
            "/api/v1/projects/:project/datasets/:dataset/tables/:table",
            post(create_table).get(get_table).delete(delete_table),
        )
        .route(
            "/api/v1/projects/:project/datasets/:dataset/tables/:table/rows",
            post(insert_rows).get(read_rows),
        )
        .route(
            "/api/v1/projects/:project/datasets/:dataset/tables/:table/labels",
            post(set_label),
        )
        .route("/api/v1/copy", post(copy_table))
        .route("/api/v1/faults", post(inject_fault))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Rejected(_) => StatusCode::BAD_REQUEST,
        };
        if status != StatusCode::NOT_FOUND {
            warn!("respondiendo {}: {}", status, self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn dataset_of(project: String, dataset: String) -> DatasetLocator {
    DatasetLocator { project, dataset }
}

fn table_of(project: String, dataset: String, table: String) -> TableLocator {
    TableLocator {
        project,
        dataset,
        table,
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_dataset(
    State(state): State<AppState>,
    Path((project, dataset)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let d = dataset_of(project, dataset);
    state.store.create_dataset(&d).await?;
    info!("dataset {} creado", d);
    Ok(StatusCode::CREATED)
}

async fn delete_dataset(
    State(state): State<AppState>,
    Path((project, dataset)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let d = dataset_of(project, dataset);
    state.store.delete_dataset(&d).await?;
    info!("dataset {} borrado", d);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tables(
    State(state): State<AppState>,
    Path((project, dataset)): Path<(String, String)>,
) -> ApiResult<Json<ListTablesResponse>> {
    let tables = state
        .store
        .list_tables(&dataset_of(project, dataset))
        .await?;
    Ok(Json(ListTablesResponse { tables }))
}

async fn create_table(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
    Json(req): Json<CreateTableRequest>,
) -> ApiResult<StatusCode> {
    let t = table_of(project, dataset, table);
    state.store.create_table(&t, &req.schema).await?;
    info!("tabla {} creada ({} campos)", t, req.schema.fields.len());
    Ok(StatusCode::CREATED)
}

async fn get_table(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
) -> ApiResult<Json<TableInfo>> {
    let info = state
        .store
        .get_table(&table_of(project, dataset, table))
        .await?;
    Ok(Json(info))
}

async fn delete_table(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let t = table_of(project, dataset, table);
    state.store.delete_table(&t).await?;
    info!("tabla {} borrada", t);
    Ok(StatusCode::NO_CONTENT)
}

async fn insert_rows(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
    Json(req): Json<RowsPayload>,
) -> ApiResult<StatusCode> {
    let t = table_of(project, dataset, table);
    state.store.insert_rows(&t, &req.rows).await?;
    info!("{} filas insertadas en {}", req.rows.len(), t);
    Ok(StatusCode::NO_CONTENT)
}

async fn read_rows(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
) -> ApiResult<Json<RowsPayload>> {
    let rows = state
        .store
        .read_rows(&table_of(project, dataset, table))
        .await?;
    Ok(Json(RowsPayload { rows }))
}

async fn set_label(
    State(state): State<AppState>,
    Path((project, dataset, table)): Path<(String, String, String)>,
    Json(req): Json<SetLabelRequest>,
) -> ApiResult<StatusCode> {
    let t = table_of(project, dataset, table);
    state.store.set_label(&t, &req.key, &req.value).await?;
    info!("label {}={} en {}", req.key, req.value, t);
    Ok(StatusCode::NO_CONTENT)
}

async fn copy_table(
    State(state): State<AppState>,
    Json(req): Json<CopyRequest>,
) -> ApiResult<Json<CopyResponse>> {
    let job_id = state
        .store
        .append_table(&req.source, &req.destination, &req.copy_id)
        .await?;
    info!("copia {} -> {} ({})", req.source, req.destination, job_id);
    Ok(Json(CopyResponse { job_id }))
}

#[derive(Debug, Deserialize)]
pub struct FaultRequest {
    pub op: StoreOp,
    pub table: Option<String>,
    pub count: u32,
}

// Para demos: hace fallar las próximas `count` llamadas a `op`
async fn inject_fault(
    State(state): State<AppState>,
    Json(req): Json<FaultRequest>,
) -> StatusCode {
    match &req.table {
        Some(t) => state.store.fail_next_on(req.op, t, req.count),
        None => state.store.fail_next(req.op, req.count),
    }
    warn!("fallo inyectado: {:?}", req);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use common::{HttpTableStore, TableSchema};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };

        let resp = app
            .clone()
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    const DS: &str = "/api/v1/projects/p/datasets/d";

    #[tokio::test]
    async fn ciclo_de_vida_de_una_tabla() {
        let app = build_router(AppState::new());
        let schema = json!({ "schema": { "fields": [{ "name": "word", "type": "STRING" }] } });

        assert_eq!(call(&app, Method::POST, DS, None).await.0, StatusCode::CREATED);
        assert_eq!(
            call(&app, Method::POST, &format!("{DS}/tables/t"), Some(schema.clone())).await.0,
            StatusCode::CREATED
        );
        assert_eq!(
            call(&app, Method::POST, &format!("{DS}/tables/t"), Some(schema)).await.0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            call(
                &app,
                Method::POST,
                &format!("{DS}/tables/t/rows"),
                Some(json!({ "rows": [{ "word": "a" }, { "word": "b" }] }))
            )
            .await
            .0,
            StatusCode::NO_CONTENT
        );

        let (status, rows) = call(&app, Method::GET, &format!("{DS}/tables/t/rows"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rows["rows"].as_array().map(|r| r.len()), Some(2));

        let (_, tables) = call(&app, Method::GET, &format!("{DS}/tables"), None).await;
        assert_eq!(tables["tables"], json!(["t"]));

        assert_eq!(
            call(&app, Method::DELETE, &format!("{DS}/tables/t"), None).await.0,
            StatusCode::NO_CONTENT
        );
        let (status, body) = call(&app, Method::GET, &format!("{DS}/tables/t"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], json!("not_found"));
    }

    #[tokio::test]
    async fn fallos_inyectados_responden_503() {
        let app = build_router(AppState::new());
        call(
            &app,
            Method::POST,
            "/api/v1/faults",
            Some(json!({ "op": "create_dataset", "count": 1 })),
        )
        .await;

        let (status, body) = call(&app, Method::POST, DS, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], json!("unavailable"));
        assert_eq!(call(&app, Method::POST, DS, None).await.0, StatusCode::CREATED);
    }

    /* --------- HttpTableStore contra el servicio real --------- */

    async fn serve(state: AppState) -> HttpTableStore {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        HttpTableStore::new(format!("http://{addr}"))
    }

    fn locator(table: &str) -> TableLocator {
        TableLocator {
            project: "p".into(),
            dataset: "d".into(),
            table: table.into(),
        }
    }

    #[tokio::test]
    async fn http_table_store_mapea_cada_error_del_servicio() {
        let state = AppState::new();
        let store = serve(state.clone()).await;
        let dataset = locator("t").dataset_locator();
        let schema = TableSchema::parse(r#"[{"name":"word","type":"STRING"}]"#).unwrap();

        store.create_dataset(&dataset).await.unwrap();
        assert!(matches!(
            store.create_dataset(&dataset).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.get_table(&locator("nada")).await,
            Err(StoreError::NotFound(_))
        ));

        store.create_table(&locator("t"), &schema).await.unwrap();
        assert!(matches!(
            store.insert_rows(&locator("t"), &[json!({"otro": 1})]).await,
            Err(StoreError::Rejected(_))
        ));

        state.store.fail_next(StoreOp::ListTables, 1);
        assert!(matches!(
            store.list_tables(&dataset).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.list_tables(&dataset).await.unwrap(), vec!["t"]);
    }

    #[tokio::test]
    async fn http_table_store_copia_una_sola_vez_por_copy_id() {
        let state = AppState::new();
        let store = serve(state.clone()).await;
        let schema = TableSchema::parse(r#"[{"name":"word","type":"STRING"}]"#).unwrap();

        store.create_dataset(&locator("a").dataset_locator()).await.unwrap();
        store.create_table(&locator("a"), &schema).await.unwrap();
        store.create_table(&locator("b"), &schema).await.unwrap();
        store
            .insert_rows(&locator("a"), &[json!({"word": "x"}), json!({"word": "y"})])
            .await
            .unwrap();

        for _ in 0..2 {
            let id = store
                .append_table(&locator("a"), &locator("b"), "copy_job_1_a")
                .await
                .unwrap();
            assert_eq!(id, "copy_job_1_a");
        }
        assert_eq!(store.read_rows(&locator("b")).await.unwrap().len(), 2);
        assert_eq!(store.get_table(&locator("b")).await.unwrap().num_rows, 2);
    }
}
