//! Event to CloudEvents envelope conversion.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EncodingError;
use crate::source::RemoteEvent;

pub const DEFAULT_EVENT_TYPE_NAMESPACE: &str = "com.vmware.vsphere";
pub const CLOUDEVENTS_SPEC_VERSION: &str = "1.0";
pub const EXTENSION_API_VERSION: &str = "vsphereapiversion";
pub const EXTENSION_EVENT_CLASS: &str = "eventclass";

/// Content type used to encode the event body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    #[default]
    Json,
    Yaml,
    Xml,
}

/// Root element wrapping an XML-encoded body.
pub const XML_ROOT_ELEMENT: &str = "event";

impl PayloadEncoding {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Yaml => "application/yaml",
            Self::Xml => "application/xml",
        }
    }

    /// Serialize `payload` in this encoding.
    pub fn encode(self, payload: &serde_json::Value) -> Result<Vec<u8>, EncodingError> {
        let encoded = match self {
            Self::Json => serde_json::to_vec(payload).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(payload)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
            Self::Xml => quick_xml::se::to_string_with_root(XML_ROOT_ELEMENT, payload)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
        };
        encoded.map_err(|reason| EncodingError::Serialize {
            encoding: self.content_type().to_string(),
            reason,
        })
    }
}

impl std::fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.content_type())
    }
}

impl FromStr for PayloadEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameters such as "; charset=utf-8" do not change the encoding.
        let media = s.split(';').next().unwrap_or_default().trim();
        match media.to_ascii_lowercase().as_str() {
            "application/json" | "text/json" => Ok(Self::Json),
            "application/yaml" | "application/x-yaml" | "text/yaml" => Ok(Self::Yaml),
            "application/xml" | "text/xml" => Ok(Self::Xml),
            _ => Err(EncodingError::Unsupported(s.to_string())),
        }
    }
}

/// Per-run settings shared by every conversion.
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub source: String,
    pub api_version: String,
    pub namespace: String,
    pub encoding: PayloadEncoding,
}

impl EnvelopeContext {
    pub fn new(
        source: impl Into<String>,
        api_version: impl Into<String>,
        encoding: PayloadEncoding,
    ) -> Self {
        Self {
            source: source.into(),
            api_version: api_version.into(),
            namespace: DEFAULT_EVENT_TYPE_NAMESPACE.to_string(),
            encoding,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// `<namespace>.<type>.v0`
    #[must_use]
    pub fn event_type(&self, type_name: &str) -> String {
        format!("{}.{}.v0", self.namespace, type_name)
    }
}

/// CloudEvents 1.0 envelope ready for delivery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub data_content_type: String,
    pub extensions: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

#[derive(Serialize)]
struct StructuredEnvelope<'a> {
    specversion: &'static str,
    id: &'a str,
    source: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    time: String,
    datacontenttype: &'a str,
    #[serde(flatten)]
    extensions: &'a BTreeMap<String, String>,
    data: serde_json::Value,
}

impl OutboundEnvelope {
    /// Structured-mode JSON rendering. JSON payloads are embedded as values;
    /// other encodings are embedded as a UTF-8 string.
    pub fn to_structured_json(&self) -> Result<String, EncodingError> {
        let data = if self.data_content_type == PayloadEncoding::Json.content_type() {
            serde_json::from_slice(&self.data).unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::String(String::from_utf8_lossy(&self.data).into_owned())
        };
        let doc = StructuredEnvelope {
            specversion: CLOUDEVENTS_SPEC_VERSION,
            id: &self.id,
            source: &self.source,
            event_type: &self.event_type,
            time: self.time.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            datacontenttype: &self.data_content_type,
            extensions: &self.extensions,
            data,
        };
        serde_json::to_string(&doc).map_err(|e| EncodingError::Serialize {
            encoding: "application/cloudevents+json".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Convert one upstream record into its envelope.
///
/// Deterministic: the same event and context always yield the same envelope.
/// Only payload encoding can fail.
pub fn convert(event: &RemoteEvent, ctx: &EnvelopeContext) -> Result<OutboundEnvelope, EncodingError> {
    let details = event.details();
    let data = ctx.encoding.encode(&event.payload)?;

    let mut extensions = BTreeMap::new();
    extensions.insert(EXTENSION_EVENT_CLASS.to_string(), details.class.to_string());
    extensions.insert(EXTENSION_API_VERSION.to_string(), ctx.api_version.clone());

    Ok(OutboundEnvelope {
        id: event.key.to_string(),
        source: ctx.source.clone(),
        event_type: ctx.event_type(&details.event_type),
        time: event.created_time,
        data_content_type: ctx.encoding.content_type().to_string(),
        extensions,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(type_name: &str, event_type_id: Option<&str>) -> RemoteEvent {
        RemoteEvent {
            key: 12,
            created_time: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            type_name: type_name.to_string(),
            event_type_id: event_type_id.map(str::to_string),
            payload: serde_json::json!({ "key": 12, "userName": "root" }),
        }
    }

    fn ctx(encoding: PayloadEncoding) -> EnvelopeContext {
        EnvelopeContext::new("https://vc01.example.com/sdk", "8.0.2.0", encoding)
    }

    #[test]
    fn converts_plain_event() {
        let env = convert(&event("UserLoginSessionEvent", None), &ctx(PayloadEncoding::Json)).unwrap();
        assert_eq!(env.id, "12");
        assert_eq!(env.source, "https://vc01.example.com/sdk");
        assert_eq!(env.event_type, "com.vmware.vsphere.UserLoginSessionEvent.v0");
        assert_eq!(env.time.timestamp(), 1_700_000_000);
        assert_eq!(env.data_content_type, "application/json");
        assert_eq!(env.extensions["eventclass"], "event");
        assert_eq!(env.extensions["vsphereapiversion"], "8.0.2.0");
        let body: serde_json::Value = serde_json::from_slice(&env.data).unwrap();
        assert_eq!(body["userName"], "root");
    }

    #[test]
    fn converts_event_ex_using_type_id() {
        let env = convert(
            &event("EventEx", Some("vim.event.SomethingHappened")),
            &ctx(PayloadEncoding::Json),
        )
        .unwrap();
        assert_eq!(env.event_type, "com.vmware.vsphere.vim.event.SomethingHappened.v0");
        assert_eq!(env.extensions["eventclass"], "eventex");
    }

    #[test]
    fn custom_namespace() {
        let c = ctx(PayloadEncoding::Json).with_namespace("org.example.vc");
        let env = convert(&event("VmCreatedEvent", None), &c).unwrap();
        assert_eq!(env.event_type, "org.example.vc.VmCreatedEvent.v0");
    }

    #[test]
    fn conversion_is_deterministic() {
        let e = event("VmCreatedEvent", None);
        let c = ctx(PayloadEncoding::Yaml);
        assert_eq!(convert(&e, &c).unwrap(), convert(&e, &c).unwrap());
    }

    #[test]
    fn yaml_payload() {
        let env = convert(&event("VmCreatedEvent", None), &ctx(PayloadEncoding::Yaml)).unwrap();
        assert_eq!(env.data_content_type, "application/yaml");
        let text = String::from_utf8(env.data).unwrap();
        assert!(text.contains("userName: root"), "{text}");
    }

    #[test]
    fn xml_payload_is_wrapped_in_root_element() {
        let env = convert(&event("VmCreatedEvent", None), &ctx(PayloadEncoding::Xml)).unwrap();
        assert_eq!(env.data_content_type, "application/xml");
        let text = String::from_utf8(env.data).unwrap();
        assert!(text.starts_with("<event>"), "{text}");
        assert!(text.ends_with("</event>"), "{text}");
        assert!(text.contains("<userName>root</userName>"), "{text}");
        assert!(text.contains("<key>12</key>"), "{text}");
    }

    #[test]
    fn xml_escapes_markup_in_values() {
        let body = PayloadEncoding::Xml
            .encode(&serde_json::json!({ "vm": "a<b&c" }))
            .unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("<vm>a&lt;b&amp;c</vm>"), "{text}");
    }

    #[test]
    fn parses_content_types() {
        assert_eq!("application/json".parse::<PayloadEncoding>().unwrap(), PayloadEncoding::Json);
        assert_eq!(
            "Application/JSON; charset=utf-8".parse::<PayloadEncoding>().unwrap(),
            PayloadEncoding::Json
        );
        assert_eq!("text/yaml".parse::<PayloadEncoding>().unwrap(), PayloadEncoding::Yaml);
        assert_eq!(
            "application/x-yaml".parse::<PayloadEncoding>().unwrap(),
            PayloadEncoding::Yaml
        );
        assert_eq!("text/xml".parse::<PayloadEncoding>().unwrap(), PayloadEncoding::Xml);
        assert_eq!(
            "application/xml; charset=utf-8".parse::<PayloadEncoding>().unwrap(),
            PayloadEncoding::Xml
        );
        let err = "text/plain".parse::<PayloadEncoding>().unwrap_err();
        assert!(matches!(err, EncodingError::Unsupported(_)));
    }

    #[test]
    fn structured_json_embeds_json_data() {
        let env = convert(&event("VmCreatedEvent", None), &ctx(PayloadEncoding::Json)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&env.to_structured_json().unwrap()).unwrap();
        assert_eq!(doc["specversion"], "1.0");
        assert_eq!(doc["id"], "12");
        assert_eq!(doc["type"], "com.vmware.vsphere.VmCreatedEvent.v0");
        assert_eq!(doc["time"], "2023-11-14T22:13:20Z");
        assert_eq!(doc["eventclass"], "event");
        assert_eq!(doc["data"]["userName"], "root");
    }

    #[test]
    fn structured_json_embeds_yaml_as_string() {
        let env = convert(&event("VmCreatedEvent", None), &ctx(PayloadEncoding::Yaml)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&env.to_structured_json().unwrap()).unwrap();
        assert!(doc["data"].as_str().unwrap().contains("userName: root"));
    }
}
