use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use svcorpus::grid::parse_point_list;
use svcorpus::{
    BoundingBox, CaptureRequest, Corpus, LatLng, LocationResult, NewPlace, Place, PlaceStore, RunStatus,
};

#[derive(Clone)]
pub struct AppState {
    pub corpus: Arc<Corpus>,
    pub places: Arc<PlaceStore>,
}

pub fn router(state: AppState, upload_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sv", post(capture))
        .route("/sv/status", get(capture_status))
        .route("/sv/csv", post(match_csv))
        .route("/locate", post(locate))
        .route("/locate/places", post(locate_with_places))
        .route("/place", get(list_places).post(add_place))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

struct Upload {
    filename: String,
    data: Bytes,
}

/// Text fields plus the first uploaded file of a multipart form.
#[derive(Default)]
struct Form {
    fields: HashMap<String, String>,
    file: Option<Upload>,
}

impl Form {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Form::default();
        while let Some(field) = multipart.next_field().await.map_err(ApiError::bad_request)? {
            let name = field.name().unwrap_or_default().to_owned();
            match field.file_name().map(str::to_owned) {
                Some(filename) => {
                    let data = field.bytes().await.map_err(ApiError::bad_request)?;
                    if form.file.is_none() {
                        form.file = Some(Upload { filename, data });
                    }
                }
                None => {
                    let text = field.text().await.map_err(ApiError::bad_request)?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    fn field<T: FromStr>(&self, name: &str) -> Result<T, ApiError> {
        let raw = self
            .fields
            .get(name)
            .ok_or_else(|| ApiError::bad_request(format!("missing field '{name}'")))?;
        raw.trim()
            .parse()
            .map_err(|_| ApiError::bad_request(format!("field '{name}' is not valid: '{raw}'")))
    }

    fn upload(&self) -> Result<&Upload, ApiError> {
        self.file
            .as_ref()
            .ok_or_else(|| ApiError::bad_request("missing file upload"))
    }

    /// Point-list upload when present, otherwise the bounding-box fields.
    fn capture_request(&self) -> Result<CaptureRequest, ApiError> {
        let theta = self.field("theta")?;
        if let Some(upload) = &self.file {
            let text = std::str::from_utf8(&upload.data)
                .map_err(|_| ApiError::bad_request("point list is not UTF-8 text"))?;
            let points = parse_point_list(text).map_err(ApiError::bad_request)?;
            return Ok(CaptureRequest::list(points, theta));
        }
        let bbox = BoundingBox::new(
            self.field("lat1")?,
            self.field("lng1")?,
            self.field("lat2")?,
            self.field("lng2")?,
        );
        Ok(CaptureRequest::mesh(bbox, self.field("density")?, theta))
    }
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    success: bool,
    run: RunStatus,
}

async fn capture(State(state): State<AppState>, multipart: Multipart) -> Result<Json<CaptureResponse>, ApiError> {
    let request = Form::read(multipart).await?.capture_request()?;
    tracing::info!(theta = request.theta, "Capture requested");
    let run = state.corpus.capture(request).await?;
    Ok(Json(CaptureResponse { success: true, run }))
}

async fn capture_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.corpus.status())
}

async fn match_csv(State(state): State<AppState>, multipart: Multipart) -> Result<impl IntoResponse, ApiError> {
    let form = Form::read(multipart).await?;
    let upload = form.upload()?;
    let query = state.corpus.store_query(&upload.filename, &upload.data).await?;
    let csv = state.corpus.match_report(&query).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"data.csv\""),
        ],
        csv,
    ))
}

async fn locate_upload(state: &AppState, multipart: Multipart, with_places: bool) -> Result<LocationResult, ApiError> {
    let form = Form::read(multipart).await?;
    let upload = form.upload()?;
    let query = state.corpus.store_query(&upload.filename, &upload.data).await?;
    Ok(state.corpus.locate(&query, with_places).await?)
}

async fn locate(State(state): State<AppState>, multipart: Multipart) -> Result<Json<LocationResult>, ApiError> {
    locate_upload(&state, multipart, false).await.map(Json)
}

async fn locate_with_places(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<LocationResult>, ApiError> {
    locate_upload(&state, multipart, true).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct PlaceQuery {
    lat: Option<f64>,
    lng: Option<f64>,
    radius: Option<f64>,
}

async fn list_places(
    State(state): State<AppState>,
    Query(query): Query<PlaceQuery>,
) -> Result<Json<Vec<Place>>, ApiError> {
    match (query.lat, query.lng) {
        (Some(lat), Some(lng)) => {
            let radius = query.radius.unwrap_or(state.corpus.config().places_radius_m);
            Ok(Json(state.places.within(LatLng::new(lat, lng), radius)?))
        }
        (None, None) => Ok(Json(state.places.list())),
        _ => Err(ApiError::bad_request("lat and lng must be given together")),
    }
}

async fn add_place(
    State(state): State<AppState>,
    Json(new): Json<NewPlace>,
) -> Result<(StatusCode, Json<Place>), ApiError> {
    let place = state.places.insert(new)?;
    Ok((StatusCode::CREATED, Json(place)))
}
