use std::convert::Infallible;
use std::time::Instant;

use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::request::{FromRequest, Outcome};
use rocket::{Data, Request, Response};
use rocket_okapi::request::OpenApiFromRequest;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Correlation id of the current request, taken from `X-Request-Id` or generated.
#[derive(Debug, Clone, OpenApiFromRequest)]
pub struct RequestId(pub String);

impl RequestId {
    pub(crate) fn resolve<'a>(request: &'a Request<'_>) -> &'a RequestId {
        request.local_cache(|| {
            let id = request
                .headers()
                .get_one(REQUEST_ID_HEADER)
                .map(str::trim)
                .filter(|id| !id.is_empty() && id.len() <= 128)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            RequestId(id)
        })
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestId {
    type Error = Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(RequestId::resolve(request).clone())
    }
}

/// Fairing to log one line per HTTP request with timing and correlation id
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
        RequestId::resolve(request);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let start_time = request.local_cache(Instant::now);
        let duration = start_time.elapsed();
        let request_id = RequestId::resolve(request);

        response.set_header(Header::new(REQUEST_ID_HEADER, request_id.0.clone()));

        log::info!(
            "{} {} -> {} ({:.2}ms) request_id={}",
            request.method(),
            request.uri(),
            response.status().code,
            duration.as_secs_f64() * 1000.0,
            request_id
        );
    }
}
