use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
    ServiceBuilderExt,
};

use crate::dashboard;
use crate::handlers::{
    delete_snapshot, get_config, get_snapshot, health, info, list_snapshots, name_usb,
    patch_snapshot, plug_usb, post_config, unname_usb, unplug_usb, upload_snapshot,
};
use crate::state::AppState;

/// How long browsers may cache a preflight answer.
const CORS_MAX_AGE: Duration = Duration::from_secs(21600);

pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS layer: Workbench and DeviceHubClient run on other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ORIGIN])
        .expose_headers([header::AUTHORIZATION])
        .max_age(CORS_MAX_AGE);

    // Security Headers
    let security_headers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    let dashboard_routes = Router::new()
        .route("/tag_computer", post(dashboard::tag_computer))
        .route(
            "/config_ini",
            get(dashboard::get_config_ini).post(dashboard::post_config_ini),
        )
        .route("/inventories", get(dashboard::inventories))
        .route("/usbs", get(dashboard::usbs))
        .route("/add_usb", post(dashboard::add_usb))
        .route("/del_usb", post(dashboard::del_usb));

    // Build router
    Router::new()
        .route("/api/health", get(health))
        // Workbench and DeviceHubClient
        .route("/info", get(info))
        .route("/config", get(get_config).post(post_config))
        .route("/snapshots", get(list_snapshots))
        .route(
            "/snapshots/{uuid}",
            get(get_snapshot).patch(patch_snapshot).delete(delete_snapshot),
        )
        .route("/snapshots/{uuid}/upload", post(upload_snapshot))
        .route("/usbs/plugged/{hid}", post(plug_usb).delete(unplug_usb))
        .route("/usbs/names/{serial}", put(name_usb).delete(unname_usb))
        .nest("/dashboard", dashboard_routes)
        // Middleware
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid)
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(state.config.request_timeout_secs),
                ))
                .layer(CompressionLayer::new())
                .layer(cors)
                .layer(security_headers),
        )
        // Shared state
        .with_state(state)
}
