//! Configuration rendering: template text plus the four membership inputs
//! in, configuration bytes out.

use minijinja::{Environment, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::constants::{template_inputs, vcl};
use crate::error::{Result, SidecarError};
use crate::watcher::EndpointConfig;

/// A syntax-checked configuration template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VclTemplate {
    source: String,
}

impl VclTemplate {
    /// Parse template text, rejecting anything that does not compile.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let source = String::from_utf8(bytes.to_vec())
            .map_err(|e| SidecarError::Template(format!("template is not valid UTF-8: {e}")))?;

        let env = Environment::new();
        if let Err(e) = env.template_from_named_str(vcl::TEMPLATE_NAME, &source) {
            return Err(SidecarError::Template(e.to_string()));
        }
        drop(env);

        Ok(Self { source })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            SidecarError::Template(format!("failed to read template {}: {e}", path.display()))
        })?;
        Self::from_bytes(&bytes)
    }

    /// Pure function of the template text and both snapshots.
    pub fn render(&self, frontend: &EndpointConfig, backend: &EndpointConfig) -> Result<Vec<u8>> {
        let env = Environment::new();
        let template = env
            .template_from_named_str(vcl::TEMPLATE_NAME, &self.source)
            .map_err(|e| SidecarError::Template(e.to_string()))?;

        let inputs = BTreeMap::from([
            (template_inputs::FRONTENDS, Value::from_serialize(&frontend.endpoints)),
            (template_inputs::PRIMARY_FRONTEND, Value::from_serialize(&frontend.primary)),
            (template_inputs::BACKENDS, Value::from_serialize(&backend.endpoints)),
            (template_inputs::PRIMARY_BACKEND, Value::from_serialize(&backend.primary)),
        ]);

        Ok(template.render(inputs)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{Endpoint, EndpointList};

    const TEMPLATE: &str = r#"vcl 4.0;
{% for b in backends %}backend be_{{ loop.index }} { .host = "{{ b.host }}"; .port = "{{ b.port }}"; }
{% endfor %}{% if primary_frontend %}# primary {{ primary_frontend.host }}:{{ primary_frontend.port }}
{% endif %}{% if primary_backend %}# default {{ primary_backend.name }}
{% endif %}# frontends {{ frontends | length }}"#;

    fn snapshot(hosts: &[&str], port: &str) -> EndpointConfig {
        let list: EndpointList = hosts
            .iter()
            .map(|h| Endpoint::new(*h, port).with_name(format!("pod-{h}")))
            .collect();
        EndpointConfig::with_stable_primary(list, None)
    }

    #[test]
    fn renders_all_four_inputs() {
        let template = VclTemplate::from_bytes(TEMPLATE.as_bytes()).unwrap();
        let frontend = snapshot(&["10.0.0.1", "10.0.0.2"], "8080");
        let backend = snapshot(&["10.1.0.1"], "80");

        let out = String::from_utf8(template.render(&frontend, &backend).unwrap()).unwrap();

        assert!(out.contains(r#"backend be_1 { .host = "10.1.0.1"; .port = "80"; }"#));
        assert!(out.contains("# primary 10.0.0.1:8080"));
        assert!(out.contains("# default pod-10.1.0.1"));
        assert!(out.ends_with("# frontends 2"));
    }

    #[test]
    fn empty_snapshots_render_without_primaries() {
        let template = VclTemplate::from_bytes(TEMPLATE.as_bytes()).unwrap();
        let empty = EndpointConfig::empty();

        let out = String::from_utf8(template.render(&empty, &empty).unwrap()).unwrap();

        assert!(!out.contains("# primary"));
        assert!(!out.contains("backend be_"));
        assert!(out.ends_with("# frontends 0"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let template = VclTemplate::from_bytes(TEMPLATE.as_bytes()).unwrap();
        let frontend = snapshot(&["10.0.0.1"], "8080");
        let backend = snapshot(&["10.1.0.1", "10.1.0.2"], "80");

        assert_eq!(
            template.render(&frontend, &backend).unwrap(),
            template.render(&frontend, &backend).unwrap()
        );
    }

    #[test]
    fn malformed_template_is_rejected_up_front() {
        let err = VclTemplate::from_bytes(b"vcl 4.0; {% for b in backends %}").unwrap_err();
        assert!(matches!(err, SidecarError::Template(_)));
    }

    #[test]
    fn runtime_failures_are_render_errors() {
        let template = VclTemplate::from_bytes(b"{{ backends | nosuchfilter }}");
        // unknown filters surface either at parse time or at render time
        match template {
            Err(e) => assert!(matches!(e, SidecarError::Template(_))),
            Ok(t) => {
                let empty = EndpointConfig::empty();
                assert!(matches!(t.render(&empty, &empty), Err(SidecarError::Render(_))));
            }
        }
    }

    #[test]
    fn missing_file_is_a_template_error() {
        let err = VclTemplate::from_file(Path::new("/nonexistent/default.vcl.tmpl")).unwrap_err();
        assert!(matches!(err, SidecarError::Template(_)));
    }
}
