//! Config rendering
//!
//! The reconciler hands render-ready models to a `Renderer` and writes
//! whatever bytes come back. `JsonRenderer` emits a canonical JSON document
//! per model, preceded by a header. Template overrides from the ConfigMap
//! replace that header, so a changed template always changes the output.

use common::{IngressConfig, MainConfig, VirtualServerConfig};
use serde::Serialize;
use thiserror::Error;

const DEFAULT_MAIN_HEADER: &str = "# main configuration generated by ingress-reconciler";
const DEFAULT_INGRESS_HEADER: &str = "# ingress configuration generated by ingress-reconciler";
const VIRTUAL_SERVER_HEADER: &str = "# virtualserver configuration generated by ingress-reconciler";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Failed to serialize {kind} config: {message}")]
    Serialize { kind: &'static str, message: String },

    #[error("Invalid {kind} template: {message}")]
    Template { kind: &'static str, message: String },
}

pub trait Renderer: Send + Sync {
    fn render_main(&self, config: &MainConfig) -> Result<Vec<u8>, RenderError>;

    fn render_ingress(&self, config: &IngressConfig) -> Result<Vec<u8>, RenderError>;

    fn render_virtual_server(&self, config: &VirtualServerConfig) -> Result<Vec<u8>, RenderError>;

    /// Swap the main template; `None` restores the built-in one
    fn update_main_template(&mut self, template: Option<&str>) -> Result<(), RenderError>;

    /// Swap the Ingress template; `None` restores the built-in one
    fn update_ingress_template(&mut self, template: Option<&str>) -> Result<(), RenderError>;
}

fn validate_template(kind: &'static str, template: &str) -> Result<String, RenderError> {
    if template.trim().is_empty() {
        return Err(RenderError::Template {
            kind,
            message: "template is empty".to_string(),
        });
    }
    Ok(template.trim_end().to_string())
}

/// Renders every model as pretty-printed JSON
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    main_header: String,
    ingress_header: String,
}

impl Default for JsonRenderer {
    fn default() -> Self {
        Self {
            main_header: DEFAULT_MAIN_HEADER.to_string(),
            ingress_header: DEFAULT_INGRESS_HEADER.to_string(),
        }
    }
}

impl JsonRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn render<T: Serialize>(kind: &'static str, header: &str, config: &T) -> Result<Vec<u8>, RenderError> {
        let body = serde_json::to_vec_pretty(config).map_err(|e| RenderError::Serialize {
            kind,
            message: e.to_string(),
        })?;
        let mut out = Vec::with_capacity(header.len() + body.len() + 2);
        out.extend_from_slice(header.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&body);
        out.push(b'\n');
        Ok(out)
    }
}

impl Renderer for JsonRenderer {
    fn render_main(&self, config: &MainConfig) -> Result<Vec<u8>, RenderError> {
        Self::render("main", &self.main_header, config)
    }

    fn render_ingress(&self, config: &IngressConfig) -> Result<Vec<u8>, RenderError> {
        Self::render("ingress", &self.ingress_header, config)
    }

    fn render_virtual_server(&self, config: &VirtualServerConfig) -> Result<Vec<u8>, RenderError> {
        Self::render("virtualserver", VIRTUAL_SERVER_HEADER, config)
    }

    fn update_main_template(&mut self, template: Option<&str>) -> Result<(), RenderError> {
        self.main_header = match template {
            Some(t) => validate_template("main", t)?,
            None => DEFAULT_MAIN_HEADER.to_string(),
        };
        Ok(())
    }

    fn update_ingress_template(&mut self, template: Option<&str>) -> Result<(), RenderError> {
        self.ingress_header = match template {
            Some(t) => validate_template("ingress", t)?,
            None => DEFAULT_INGRESS_HEADER.to_string(),
        };
        Ok(())
    }
}
