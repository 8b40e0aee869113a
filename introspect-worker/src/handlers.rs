//! Query handlers backed by the loaded application runtime.

use std::sync::Arc;

use introspect::{
    Handler, HandlerError, MODEL_METHOD, Params, ROUTE_METHOD, Router, str_param,
};
use serde::Serialize;
use serde_json::Value;

use crate::app::AppRuntime;

/// `model {name}` -> columns and schema file, or null.
pub struct ModelHandler {
    app: Arc<AppRuntime>,
}

impl Handler for ModelHandler {
    fn call(&self, params: Option<&Params>) -> Result<Value, HandlerError> {
        let name = str_param(params, "name")?;
        to_result(self.app.model(name))
    }
}

/// `route {controller, action}` -> path, verb and source location, or null.
pub struct RouteHandler {
    app: Arc<AppRuntime>,
}

impl Handler for RouteHandler {
    fn call(&self, params: Option<&Params>) -> Result<Value, HandlerError> {
        let controller = str_param(params, "controller")?;
        let action = str_param(params, "action")?;
        to_result(self.app.route(controller, action))
    }
}

fn to_result<T: Serialize>(payload: Option<T>) -> Result<Value, HandlerError> {
    serde_json::to_value(payload)
        .map_err(|e| HandlerError::failed(format!("failed to encode result: {}", e)))
}

pub fn router(app: Arc<AppRuntime>) -> Router {
    Router::new()
        .route(MODEL_METHOD, ModelHandler { app: Arc::clone(&app) })
        .route(ROUTE_METHOD, RouteHandler { app })
}

#[cfg(test)]
mod tests {
    use super::*;
    use introspect::{ModelInfo, Request, Response, RouteInfo, UNKNOWN_ROUTE};
    use serde_json::json;
    use std::path::PathBuf;

    fn fixture_router() -> Router {
        let manifest =
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/app/manifest.json");
        router(Arc::new(AppRuntime::load(&manifest).unwrap()))
    }

    fn params(value: Value) -> Option<Params> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    #[test]
    fn registers_both_queries() {
        assert_eq!(fixture_router().len(), 2);
    }

    #[test]
    fn model_result_has_column_pairs() {
        let response =
            fixture_router().dispatch(&Request::new(MODEL_METHOD, params(json!({"name": "User"}))));

        let Response::Result(value) = response else {
            panic!("expected a result, got {:?}", response);
        };
        assert_eq!(value["columns"][0], json!(["id", "integer"]));
        let info: ModelInfo = serde_json::from_value(value).unwrap();
        assert_eq!(info.columns.len(), 6);
    }

    #[test]
    fn unknown_model_is_null() {
        let response =
            fixture_router().dispatch(&Request::new(MODEL_METHOD, params(json!({"name": "Foo"}))));
        assert_eq!(response, Response::Result(Value::Null));
    }

    #[test]
    fn route_result_has_source_location_pair() {
        let response = fixture_router().dispatch(&Request::new(
            ROUTE_METHOD,
            params(json!({"controller": "UsersController", "action": "index"})),
        ));

        let Response::Result(value) = response else {
            panic!("expected a result, got {:?}", response);
        };
        assert_eq!(value["verb"], json!("GET"));
        assert_eq!(value["source_location"][1], json!(4));
        let info: RouteInfo = serde_json::from_value(value).unwrap();
        assert!(info.source_location.file().ends_with("config/routes.rb"));
    }

    #[test]
    fn route_requires_action() {
        let response = fixture_router().dispatch(&Request::new(
            ROUTE_METHOD,
            params(json!({"controller": "UsersController"})),
        ));
        assert_eq!(response, Response::error("missing parameter: action"));
    }

    #[test]
    fn unregistered_method() {
        let response = fixture_router().dispatch(&Request::new("reload", None));
        assert_eq!(response, Response::error(UNKNOWN_ROUTE));
    }
}
