//! Built-in scenarios
//!
//! Each variant of the chat service workload is a [`Scenario`] value rather than a
//! separate script.

use super::step::{
    Expectation, FailurePolicy, HttpStep, MessagePredicate, Scenario, ScenarioStep, Step,
    WebSocketStep, default_messages,
};
use serde_json::{Value, json};

pub const NAMES: &[&str] = &[
    "login",
    "message_send",
    "message_read",
    "chat",
    "subscription",
    "stream_create",
    "stream_lifecycle",
    "ping",
];

pub fn get(name: &str) -> Option<Scenario> {
    let steps = match name {
        "login" => vec![ScenarioStep::new(Step::Http(login()))],
        "message_send" => vec![ScenarioStep::new(Step::TimedHttp {
            metric: "message_send_time".to_string(),
            request: send_message(),
        })],
        "message_read" => vec![ScenarioStep::new(Step::TimedHttp {
            metric: "message_read_time".to_string(),
            request: HttpStep::get("/messages/stream")
                .query("stream_id", "{stream_id}")
                .expect_status("messages fetched successfully", 200),
        })],
        "chat" => vec![ScenarioStep::new(Step::WebSocket(WebSocketStep {
            url: None,
            connect_check: "WebSocket connection was successful".to_string(),
            connect_metric: Some("ws_connect_time".to_string()),
            on_open: Some(send_message()),
            message_check: "Received expected response".to_string(),
            predicate: MessagePredicate::Contains {
                text: "{message}".to_string(),
            },
            listen_timeout_ms: 5_000,
            expected_messages: 1,
        }))],
        "subscription" => vec![ScenarioStep::new(Step::TimedHttp {
            metric: "subscription_time".to_string(),
            request: HttpStep::post("/users/me/subscriptions")
                .json(json!({ "stream_id": "{stream_id}" }))
                .expect_status("subscription successful", 200),
        })],
        "stream_create" => vec![ScenarioStep::new(Step::TimedHttp {
            metric: "stream_create_time".to_string(),
            request: HttpStep::post("/stream/create")
                .json(json!({ "name": "Stream-{n}", "type": "배달" }))
                .expect_status("is status 201", 201),
        })],
        "stream_lifecycle" => vec![
            ScenarioStep::new(Step::Http(
                HttpStep::post("/stream/{stream_id}/active").expect_status("stream activated", 200),
            )),
            ScenarioStep::new(Step::TimedHttp {
                metric: "message_send_time".to_string(),
                request: send_message(),
            }),
            ScenarioStep::always(Step::Http(
                HttpStep::post("/stream/deactive")
                    .json(json!({ "stream_id": "{stream_id}" }))
                    .expect_status("stream deactivated", 200),
            )),
        ],
        "ping" => vec![ScenarioStep::new(Step::TimedHttp {
            metric: "ping_time".to_string(),
            request: HttpStep::get("/test/ping")
                .anonymous()
                .expect_status("status is 200", 200)
                .check(
                    "response body is correct",
                    Expectation::JsonField {
                        path: "message".to_string(),
                        equals: Some(Value::from("pong")),
                    },
                ),
        })],
        _ => return None,
    };

    Some(Scenario {
        name: name.to_string(),
        failure_policy: FailurePolicy::FailFast,
        messages: default_messages(),
        steps,
    })
}

fn login() -> HttpStep {
    HttpStep::post("{login_path}")
        .anonymous()
        .form(&[
            ("grant_type", "password"),
            ("username", "{username}"),
            ("password", "{password}"),
        ])
        .expect_status("login successful", 200)
        .check(
            "token received",
            Expectation::JsonField {
                path: "access_token".to_string(),
                equals: None,
            },
        )
}

fn send_message() -> HttpStep {
    HttpStep::post("/messages/send/stream/{stream_id}")
        .query("lifetime_seconds", "3600")
        .form(&[("message_content", "{message}")])
        .expect_status("message sent successfully", 200)
}
