use crate::error::AppError;
use crate::language::supported_languages;
use actix_web::HttpResponse;
use serde_json::json;

/// `GET /api/v1/languages`
pub async fn list_languages() -> Result<HttpResponse, AppError> {
    let languages = supported_languages();
    let camera = languages.iter().filter(|l| l.supports_camera).count();

    Ok(HttpResponse::Ok().json(json!({
        "languages": languages,
        "total": languages.len(),
        "camera_supported": camera
    })))
}
