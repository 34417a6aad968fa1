//! Request extractors whose rejections answer with the `{"error": ..}` body

use crate::error::WorkbenchError;
use axum::extract::{FromRequest, FromRequestParts};

/// `axum::Json` with a [`WorkbenchError`] rejection.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(WorkbenchError))]
pub struct AppJson<T>(pub T);

/// `axum::extract::Query` with a [`WorkbenchError`] rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(WorkbenchError))]
pub struct AppQuery<T>(pub T);

/// `axum::extract::Path` with a [`WorkbenchError`] rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(WorkbenchError))]
pub struct AppPath<T>(pub T);
