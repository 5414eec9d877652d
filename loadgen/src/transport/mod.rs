//! Thin network primitives used by the scenario executor and provisioner

pub mod http;
pub mod websocket;

pub use http::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestBody, join_url, json_path,
};
pub use websocket::{WsAuth, WsClient, WsEvent, WsState};
