use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// All tracked session pipelines, newest first.
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.registry.list();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// The newest session pipeline for a stream id.
pub async fn get_session(
    state: web::Data<AppState>,
    stream_id: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let stream_id = stream_id.into_inner();
    let session = state
        .registry
        .get(&stream_id)
        .ok_or_else(|| AppError::NotFound(format!("No session for stream '{}'", stream_id)))?;

    Ok(HttpResponse::Ok().json(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::{PipelineStage, SessionRecord};
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};
    use uuid::Uuid;

    #[actix_web::test]
    async fn test_session_lookup() {
        let state = test_state();
        let session = Uuid::new_v4();
        state
            .registry
            .register(SessionRecord::new("abc".to_string(), session, 16000));
        state.registry.set_stage(session, PipelineStage::Transcoding);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/sessions", web::get().to(list_sessions))
                .route("/sessions/{stream_id}", web::get().to(get_session)),
        )
        .await;

        let req = test::TestRequest::get().uri("/sessions/abc").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stream_id"], "abc");
        assert_eq!(body["stage"], "transcoding");
        assert_eq!(body["sample_rate"], 16000);

        let req = test::TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);

        let req = test::TestRequest::get().uri("/sessions/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
