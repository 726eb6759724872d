//! Request routing and JSON handlers.

use crate::engine::{Engine, EngineError};
use crate::stream::{self, MjpegStream};
use attendance_core::{CaptureFrame, LiveFrame};
use image::RgbImage;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Dashboard,
    RegisterCheck,
    Train,
    CurrentAttendance,
    SaveAttendance,
    ClearAttendance,
    DangerClear,
    RegisterFeed { student_id: String, name: String },
    AttendanceFeed,
    NotFound,
}

fn decode(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
        .filter(|s| !s.is_empty())
}

pub fn route(method: &Method, url: &str) -> Route {
    let path = url.split('?').next().unwrap_or_default();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (Method::Get, ["api", "dashboard"]) => Route::Dashboard,
        (Method::Post, ["api", "register", "check"]) => Route::RegisterCheck,
        (Method::Post, ["api", "train"]) => Route::Train,
        (Method::Get, ["api", "attendance", "current"]) => Route::CurrentAttendance,
        (Method::Post, ["api", "attendance", "save"]) => Route::SaveAttendance,
        (Method::Post, ["api", "attendance", "clear"]) => Route::ClearAttendance,
        (Method::Post, ["api", "danger", "clear"]) => Route::DangerClear,
        (Method::Get, ["video_feed", "attendance"]) => Route::AttendanceFeed,
        (Method::Get, ["video_feed", "register", id, name]) => match (decode(id), decode(name)) {
            (Some(student_id), Some(name)) => Route::RegisterFeed { student_id, name },
            _ => Route::NotFound,
        },
        _ => Route::NotFound,
    }
}

/// What to send back for a request.
pub enum Reply {
    Json { status: u16, body: Value },
    Stream(Box<dyn Read + Send>),
}

impl Reply {
    fn ok(message: impl Into<String>) -> Self {
        Reply::Json {
            status: 200,
            body: json!({ "success": true, "message": message.into() }),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Reply::Json {
            status,
            body: json!({ "success": false, "message": message.into() }),
        }
    }

    fn from_error(err: &EngineError) -> Self {
        Reply::error(err.status(), err.to_string())
    }
}

/// Read a string field; numeric ids are accepted and stringified.
fn field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stream `frames` as MJPEG. The first frame is pulled up front, so a camera
/// that opens but never delivers is answered with its error status.
fn stream_reply<I, T, E>(feed: &'static str, mut frames: I, image: fn(T) -> RgbImage) -> Reply
where
    I: Iterator<Item = Result<T, E>> + Send + 'static,
    E: Into<EngineError> + std::fmt::Display,
{
    let first = match frames.next() {
        Some(Ok(frame)) => Some(image(frame)),
        Some(Err(e)) => {
            tracing::warn!(feed, error = %e, "feed failed to start");
            return Reply::from_error(&e.into());
        }
        None => None,
    };
    let rest = frames.map_while(move |frame| match frame {
        Ok(frame) => Some(image(frame)),
        Err(e) => {
            tracing::warn!(feed, error = %e, "feed stopped");
            None
        }
    });
    Reply::Stream(Box::new(MjpegStream::new(first.into_iter().chain(rest))))
}

pub fn dispatch(engine: &Engine, route: Route, body: &str) -> Reply {
    let json_body = || serde_json::from_str::<Value>(body).unwrap_or(Value::Null);

    match route {
        Route::Dashboard => Reply::Json {
            status: 200,
            body: json!(engine.dashboard()),
        },
        Route::RegisterCheck => {
            let body = json_body();
            let (Some(id), Some(name)) = (field(&body, "student_id"), field(&body, "name")) else {
                return Reply::error(400, "ID and Name required");
            };
            match engine.register_student(&id, &name) {
                Ok(student) => Reply::ok(format!("Student {} ({}) added.", student.name, student.id)),
                Err(e) => Reply::from_error(&e),
            }
        }
        Route::Train => match engine.train() {
            Ok(summary) => Reply::ok(format!(
                "Model trained on {} images of {} students.",
                summary.faces,
                summary.per_student.len()
            )),
            Err(e) => Reply::from_error(&e),
        },
        Route::CurrentAttendance => {
            let students: Vec<Value> = engine
                .current_attendance()
                .into_iter()
                .map(|s| json!({ "id": s.id, "name": s.name }))
                .collect();
            Reply::Json {
                status: 200,
                body: json!({ "students": students }),
            }
        }
        Route::SaveAttendance => match engine.save_attendance() {
            Ok(summary) => Reply::Json {
                status: 200,
                body: json!({
                    "success": true,
                    "message": format!("Saved {} records.", summary.saved),
                    "saved": summary.saved,
                    "already_marked": summary.already_marked,
                }),
            },
            Err(e) => Reply::from_error(&e),
        },
        Route::ClearAttendance => {
            engine.clear_roster();
            Reply::ok("Cleared session.")
        }
        Route::DangerClear => {
            let password = field(&json_body(), "password").unwrap_or_default();
            match engine.clear_all(&password) {
                Ok(()) => Reply::ok("All student data cleared."),
                Err(EngineError::Forbidden) => Reply::error(403, "Incorrect Password"),
                Err(e) => Reply::from_error(&e),
            }
        }
        Route::AttendanceFeed => match engine.attendance_stream() {
            Ok(frames) => stream_reply("attendance", frames, |frame: LiveFrame| frame.image),
            Err(e) => Reply::from_error(&e),
        },
        Route::RegisterFeed { student_id, name } => match engine.registration_stream(&student_id) {
            Ok(frames) => {
                tracing::info!(%student_id, %name, "registration feed started");
                stream_reply("registration", frames, |frame: CaptureFrame| frame.image)
            }
            Err(e) => Reply::from_error(&e),
        },
        Route::NotFound => Reply::error(404, "Not found"),
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn respond(request: Request, reply: Reply) -> std::io::Result<()> {
    match reply {
        Reply::Json { status, body } => {
            let data = body.to_string().into_bytes();
            let len = data.len();
            let headers = header("Content-Type", "application/json").into_iter().collect();
            request.respond(Response::new(StatusCode(status), headers, Cursor::new(data), Some(len), None))
        }
        Reply::Stream(reader) => {
            let headers = [
                header("Content-Type", stream::CONTENT_TYPE),
                header("Cache-Control", "no-cache"),
            ]
            .into_iter()
            .flatten()
            .collect();
            request.respond(Response::new(StatusCode(200), headers, reader, None, None))
        }
    }
}

/// Serve one request to completion. Streams block until the client leaves
/// or the frame source ends.
pub fn handle(engine: &Engine, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let route = route(&method, &url);
    tracing::debug!(%method, %url, ?route, "request");

    let mut body = String::new();
    if method == Method::Post {
        if let Err(e) = request.as_reader().read_to_string(&mut body) {
            tracing::warn!(%url, error = %e, "failed to read request body");
        }
    }

    let reply = dispatch(engine, route, &body);
    if let Err(e) = respond(request, reply) {
        // Usually a client closing an MJPEG stream.
        tracing::debug!(%url, error = %e, "response ended early");
    }
}

/// Accept requests until the server is unblocked, one thread per request.
pub fn serve(server: &Server, engine: &Arc<Engine>) {
    for request in server.incoming_requests() {
        let engine = Arc::clone(engine);
        let spawned = std::thread::Builder::new()
            .name("attendanced-http".into())
            .spawn(move || handle(&engine, request));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn request thread");
        }
    }
    tracing::info!("http listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine, engine_with_camera, FakeCamera};

    fn json(reply: Reply) -> (u16, Value) {
        match reply {
            Reply::Json { status, body } => (status, body),
            Reply::Stream(_) => panic!("expected a JSON reply"),
        }
    }

    #[test]
    fn test_routes() {
        assert_eq!(route(&Method::Get, "/api/dashboard"), Route::Dashboard);
        assert_eq!(route(&Method::Get, "/api/dashboard?x=1"), Route::Dashboard);
        assert_eq!(route(&Method::Post, "/api/dashboard"), Route::NotFound);
        assert_eq!(route(&Method::Post, "/api/danger/clear"), Route::DangerClear);
        assert_eq!(route(&Method::Get, "/video_feed/attendance"), Route::AttendanceFeed);
        assert_eq!(
            route(&Method::Get, "/video_feed/register/S%201/Ana%20Mar%C3%ADa"),
            Route::RegisterFeed { student_id: "S 1".into(), name: "Ana María".into() }
        );
        assert_eq!(route(&Method::Get, "/video_feed/register/S1"), Route::NotFound);
        assert_eq!(route(&Method::Get, "/nope"), Route::NotFound);
    }

    #[test]
    fn test_register_check() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);

        let (status, _) = json(dispatch(&engine, Route::RegisterCheck, r#"{"name":"Alice"}"#));
        assert_eq!(status, 400);
        let (status, _) = json(dispatch(&engine, Route::RegisterCheck, "not json"));
        assert_eq!(status, 400);

        let (status, body) = json(dispatch(&engine, Route::RegisterCheck, r#"{"student_id":7,"name":"Alice"}"#));
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);

        let (status, body) = json(dispatch(&engine, Route::RegisterCheck, r#"{"student_id":"7","name":"Bob"}"#));
        assert_eq!(status, 400);
        assert_eq!(body["success"], false);

        let (_, body) = json(dispatch(&engine, Route::Dashboard, ""));
        assert_eq!(body["total_students"], 1);
        assert_eq!(body["today_count"], 0);
        assert_eq!(body["students"][0]["Name"], "Alice");
    }

    #[test]
    fn test_roster_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        engine.register_student("S1", "Alice").unwrap();
        engine.session().add("S1");
        engine.session().add("S2");

        let (_, body) = json(dispatch(&engine, Route::CurrentAttendance, ""));
        assert_eq!(body["students"][0], json!({"id": "S1", "name": "Alice"}));
        assert_eq!(body["students"][1], json!({"id": "S2", "name": "Unknown"}));

        let (status, body) = json(dispatch(&engine, Route::SaveAttendance, ""));
        assert_eq!(status, 200);
        assert_eq!(body["saved"], 2);

        let (status, body) = json(dispatch(&engine, Route::SaveAttendance, ""));
        assert_eq!(status, 200);
        assert_eq!(body["saved"], 0);

        engine.session().add("S1");
        let (status, _) = json(dispatch(&engine, Route::ClearAttendance, ""));
        assert_eq!(status, 200);
        assert!(engine.session().is_empty());
    }

    #[test]
    fn test_train_and_danger_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Some("letmein"));

        let (status, body) = json(dispatch(&engine, Route::Train, ""));
        assert_eq!(status, 500);
        assert_eq!(body["success"], false);

        let (status, body) = json(dispatch(&engine, Route::DangerClear, r#"{"password":"nope"}"#));
        assert_eq!(status, 403);
        assert_eq!(body["message"], "Incorrect Password");

        let (status, _) = json(dispatch(&engine, Route::DangerClear, r#"{"password":"letmein"}"#));
        assert_eq!(status, 200);
    }

    #[test]
    fn test_attendance_feed_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        let (status, _) = json(dispatch(&engine, Route::AttendanceFeed, ""));
        assert_eq!(status, 409);
    }

    #[test]
    fn test_register_feed_streams_jpeg_parts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        engine.register_student("S1", "Alice").unwrap();

        let route = Route::RegisterFeed { student_id: "S1".into(), name: "Alice".into() };
        let Reply::Stream(mut reader) = dispatch(&engine, route.clone(), "") else {
            panic!("expected a stream");
        };
        // Camera is held while the stream is alive.
        let (status, _) = json(dispatch(&engine, route, ""));
        assert_eq!(status, 409);

        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert_eq!(body.windows(header.len()).filter(|w| *w == header).count(), 3);
        drop(reader);
        assert!(engine.acquire_camera().is_ok());
    }

    #[test]
    fn test_silent_camera_is_unavailable_not_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_camera(dir.path(), None, FakeCamera { frames: 0 });
        engine.register_student("S1", "Alice").unwrap();

        let route = Route::RegisterFeed { student_id: "S1".into(), name: "Alice".into() };
        let (status, body) = json(dispatch(&engine, route, ""));
        assert_eq!(status, 503);
        assert_eq!(body["success"], false);
        // The failed stream gave the camera back.
        assert!(engine.acquire_camera().is_ok());
    }
}
