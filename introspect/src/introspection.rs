//! Fixed-shape payloads for the queries the worker answers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Params;

pub const MODEL_METHOD: &str = "model";
pub const ROUTE_METHOD: &str = "route";

/// Database-backed model: ordered `(column name, column type)` pairs and the
/// schema file that declares them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub columns: Vec<(String, String)>,
    pub schema_file: PathBuf,
}

/// File and 1-based line, encoded as `[file, line]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation(pub PathBuf, pub u32);

impl SourceLocation {
    pub fn file(&self) -> &std::path::Path {
        &self.0
    }

    pub fn line(&self) -> u32 {
        self.1
    }
}

/// Route serving a controller action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub path: String,
    pub verb: String,
    pub source_location: SourceLocation,
}

pub fn model_params(name: &str) -> Params {
    let mut params = Params::new();
    params.insert("name".to_string(), name.into());
    params
}

pub fn route_params(controller: &str, action: &str) -> Params {
    let mut params = Params::new();
    params.insert("controller".to_string(), controller.into());
    params.insert("action".to_string(), action.into());
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_info_uses_column_pairs() {
        let info: ModelInfo = serde_json::from_value(json!({
            "columns": [["id", "integer"], ["name", "string"]],
            "schema_file": "/app/db/schema.rb",
        }))
        .unwrap();

        assert_eq!(
            info.columns,
            vec![
                ("id".to_string(), "integer".to_string()),
                ("name".to_string(), "string".to_string()),
            ]
        );
        assert!(info.schema_file.ends_with("db/schema.rb"));
    }

    #[test]
    fn route_info_shape() {
        let info = RouteInfo {
            path: "/users(.:format)".to_string(),
            verb: "GET".to_string(),
            source_location: SourceLocation(PathBuf::from("config/routes.rb"), 4),
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "path": "/users(.:format)",
          "verb": "GET",
          "source_location": [
            "config/routes.rb",
            4
          ]
        }
        "#);
    }

    #[test]
    fn route_params_carry_both_keys() {
        let params = route_params("UsersController", "index");
        assert_eq!(params["controller"], json!("UsersController"));
        assert_eq!(params["action"], json!("index"));
    }
}
