use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use serde::Serialize;

use crate::metrics::{METRICS, MetricsSnapshot};

#[derive(Serialize)]
struct ProbeResp<'a> {
    status: &'a str,
}

#[get("/k8s/readyz")]
async fn readyz() -> impl Responder {
    if METRICS.is_ready() {
        HttpResponse::Ok().json(ProbeResp { status: "ok" })
    } else {
        HttpResponse::ServiceUnavailable().json(ProbeResp { status: "starting" })
    }
}

#[get("/k8s/livez")]
async fn livez() -> impl Responder {
    HttpResponse::Ok().json(ProbeResp { status: "ok" })
}

fn exposition(m: &MetricsSnapshot) -> String {
    format!(
        concat!(
            "# HELP chorus_uptime_seconds Seconds since process start\n",
            "# TYPE chorus_uptime_seconds counter\n",
            "chorus_uptime_seconds {}\n",
            "# HELP chorus_ready 1 if ready, 0 otherwise\n",
            "# TYPE chorus_ready gauge\n",
            "chorus_ready {}\n",
            "# HELP chorus_active_sessions Guilds with a live playback session\n",
            "# TYPE chorus_active_sessions gauge\n",
            "chorus_active_sessions {}\n",
            "# HELP chorus_sessions_created_total Sessions created since start\n",
            "# TYPE chorus_sessions_created_total counter\n",
            "chorus_sessions_created_total {}\n",
            "# HELP chorus_searches_total Queries resolved\n",
            "# TYPE chorus_searches_total counter\n",
            "chorus_searches_total {}\n",
            "# HELP chorus_search_fallbacks_total Queries answered by the fallback load\n",
            "# TYPE chorus_search_fallbacks_total counter\n",
            "chorus_search_fallbacks_total {}\n",
            "# HELP chorus_notifications_total Notifications dispatched\n",
            "# TYPE chorus_notifications_total counter\n",
            "chorus_notifications_total {}\n",
            "# HELP chorus_external_dropped_total Notifications the external sink dropped\n",
            "# TYPE chorus_external_dropped_total counter\n",
            "chorus_external_dropped_total {}\n",
            "# HELP chorus_external_enabled 1 if the external sink is connected\n",
            "# TYPE chorus_external_enabled gauge\n",
            "chorus_external_enabled {}\n"
        ),
        m.uptime_secs,
        u8::from(m.ready),
        m.active_sessions,
        m.sessions_created,
        m.searches,
        m.search_fallbacks,
        m.notifications,
        m.external_dropped,
        u8::from(m.external_enabled),
    )
}

#[get("/k8s/metrics")]
async fn metrics() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(exposition(&METRICS.snapshot()))
}

pub async fn run_http(bind: String) -> std::io::Result<()> {
    HttpServer::new(|| App::new().service(readyz).service(livez).service(metrics))
        .bind(bind)?
        .workers(1)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test};

    use super::*;

    #[actix_web::test]
    async fn probes_answer() {
        let app = test::init_service(App::new().service(livez).service(metrics)).await;

        let req = test::TestRequest::get().uri("/k8s/livez").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/k8s/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("chorus_active_sessions"));
    }
}
