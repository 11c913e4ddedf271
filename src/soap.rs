//! SOAP transport: sends UPnP actions and SUBSCRIBE/UNSUBSCRIBE requests,
//! and normalizes XML replies into flat key/value maps.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use reqwest::Client;
use xml::reader::XmlEvent;
use xml::EventReader;

use crate::error::{DlnaError, Result};

const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// Flattens an XML document into a map keyed by local element name, with
/// attributes additionally keyed as `parent.attribute` (e.g. `item.id`,
/// `item.parentID`). Duplicate keys take the last value seen.
pub fn flatten_xml(xml: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    let mut stack: Vec<(String, String)> = Vec::new();
    let reader = EventReader::new(Cursor::new(xml.as_bytes()));

    for event in reader {
        match event.map_err(|e| DlnaError::MalformedXml(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let local = name.local_name.clone();
                for attr in attributes {
                    let key = format!("{}.{}", local, attr.name.local_name);
                    map.insert(key, attr.value);
                }
                stack.push((local, String::new()));
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                if let Some((_, buf)) = stack.last_mut() {
                    buf.push_str(&text);
                }
            }
            XmlEvent::EndElement { .. } => {
                if let Some((local, buf)) = stack.pop() {
                    map.insert(local, buf.trim().to_string());
                }
            }
            _ => {}
        }
    }

    Ok(map)
}

/// A SOAP fault parsed out of a non-2xx response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub fault_string: String,
    pub error_code: String,
    pub error_description: String,
}

fn parse_soap_fault(body: &str) -> Option<SoapFault> {
    let map = flatten_xml(body).ok()?;
    if !map.contains_key("faultstring") && !map.contains_key("errorCode") {
        return None;
    }
    Some(SoapFault {
        fault_string: map.get("faultstring").cloned().unwrap_or_default(),
        error_code: map.get("errorCode").cloned().unwrap_or_default(),
        error_description: map.get("errorDescription").cloned().unwrap_or_default(),
    })
}

fn build_envelope(service_type: &str, action: &str, args: &str) -> String {
    format!(
        r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{action} xmlns:u="{service_type}">{args}</u:{action}></s:Body></s:Envelope>"#,
        action = action,
        service_type = service_type,
        args = args,
    )
}

/// The outcome of a successful [`SoapTransport::invoke`]: the flattened
/// response fields plus the measured round trip, which callers fold into
/// the session's position offset so polled positions stay smooth.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub fields: HashMap<String, String>,
    pub round_trip: Duration,
}

/// Thin wrapper around a shared [`reqwest::Client`] implementing the SOAP
/// 1.1 request/response shape UPnP control points use, plus GENA
/// SUBSCRIBE/UNSUBSCRIBE.
#[derive(Debug, Clone)]
pub struct SoapTransport {
    client: Client,
    user_agent: String,
    friendly_name: String,
}

impl SoapTransport {
    pub fn new(client: Client, user_agent: String, friendly_name: String) -> Self {
        Self {
            client,
            user_agent,
            friendly_name,
        }
    }

    /// HTTP GET + XML parse, used to fetch device descriptions and SCPD
    /// documents.
    pub async fn fetch_xml(&self, url: &str) -> Result<HashMap<String, String>> {
        trace!("Fetching XML from {}", url);
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .header("FriendlyName.dlna.org", self.friendly_name.clone())
            .header("Accept", "text/xml")
            .send()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))?;

        flatten_xml(&body)
    }

    /// Invokes a single SOAP action on a renderer's control URL.
    pub async fn invoke(
        &self,
        service_type: &str,
        control_url: &str,
        action: &str,
        args: &str,
        content_features: Option<&str>,
        timeout: Duration,
    ) -> Result<InvokeResult> {
        let envelope = build_envelope(service_type, action, args);
        let soap_action = format!("\"{}#{}\"", service_type, action);
        trace!("Invoking {} with payload {}", action, args);

        let mut request = self
            .client
            .post(control_url)
            .timeout(timeout)
            .header("Content-Type", DEFAULT_CONTENT_TYPE)
            .header("SOAPACTION", soap_action)
            .header("transferMode.dlna.org", "Streaming")
            .body(envelope);
        if let Some(features) = content_features {
            request = request.header("contentFeatures.dlna.org", features.to_string());
        }

        let started_at = Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!("SOAP action {} failed: {}", action, e);
            DlnaError::Network(e.to_string())
        })?;
        let round_trip = started_at.elapsed();
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))?;

        if !status.is_success() {
            if let Some(fault) = parse_soap_fault(&body) {
                error!(
                    "SOAP action {} returned fault {}: {}",
                    action, fault.error_code, fault.fault_string
                );
                return Err(DlnaError::SoapFault {
                    fault_string: fault.fault_string,
                    error_code: fault.error_code,
                    error_description: fault.error_description,
                });
            }
            warn!(
                "SOAP action {} returned HTTP {} with no parseable fault",
                action, status
            );
            return Ok(InvokeResult {
                fields: HashMap::new(),
                round_trip,
            });
        }

        let fields = flatten_xml(&body)?;
        trace!("Received {} response: {:?}", action, fields);
        Ok(InvokeResult { fields, round_trip })
    }

    /// Issues `SUBSCRIBE`, returning the renewed/initial SID.
    pub async fn subscribe(
        &self,
        event_sub_url: &str,
        callback_url: &str,
        state_vars: &[&str],
        existing_sid: Option<&str>,
    ) -> Result<String> {
        let mut request = self.client.request(
            reqwest::Method::from_bytes(b"SUBSCRIBE").expect("SUBSCRIBE is a valid HTTP method"),
            event_sub_url,
        );
        if let Some(sid) = existing_sid {
            request = request.header("SID", sid.to_string());
        } else {
            request = request
                .header("CALLBACK", format!("<{}>", callback_url))
                .header("NT", "upnp:event");
        }
        request = request
            .header("TIMEOUT", "Second-60")
            .header("STATEVAR", state_vars.join(","));

        let response = request
            .send()
            .await
            .map_err(|e| DlnaError::Network(e.to_string()))?;
        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();
        debug!("Subscribed to {} with SID {}", event_sub_url, sid);
        Ok(sid)
    }

    /// Issues `UNSUBSCRIBE`. Always best-effort: errors are logged, not
    /// propagated.
    pub async fn unsubscribe(&self, event_sub_url: &str, sid: &str) {
        let request = self
            .client
            .request(
                reqwest::Method::from_bytes(b"UNSUBSCRIBE")
                    .expect("UNSUBSCRIBE is a valid HTTP method"),
                event_sub_url,
            )
            .header("SID", sid.to_string());

        if let Err(e) = request.send().await {
            debug!("Best-effort unsubscribe from {} failed: {}", event_sub_url, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    #[test]
    fn test_flatten_xml_simple_elements() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"><CurrentTransportState>PLAYING</CurrentTransportState><CurrentSpeed>1</CurrentSpeed></u:GetTransportInfoResponse></s:Body></s:Envelope>"#;

        let map = flatten_xml(xml).unwrap();

        assert_eq!(Some(&"PLAYING".to_string()), map.get("CurrentTransportState"));
        assert_eq!(Some(&"1".to_string()), map.get("CurrentSpeed"));
    }

    #[test]
    fn test_flatten_xml_nested_attributes() {
        let xml = r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"><item id="42" parentID="0"><res>http://host/a</res></item></DIDL-Lite>"#;

        let map = flatten_xml(xml).unwrap();

        assert_eq!(Some(&"42".to_string()), map.get("item.id"));
        assert_eq!(Some(&"0".to_string()), map.get("item.parentID"));
        assert_eq!(Some(&"http://host/a".to_string()), map.get("res"));
    }

    #[test]
    fn test_flatten_xml_duplicate_keys_take_last() {
        let xml = r#"<root><a>first</a><a>second</a></root>"#;
        let map = flatten_xml(xml).unwrap();
        assert_eq!(Some(&"second".to_string()), map.get("a"));
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/AVTransport/control")
                .header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body></s:Envelope>"#,
            );
        });
        let transport = SoapTransport::new(Client::new(), "test-agent".to_string(), "test".to_string());

        let result = transport
            .invoke(
                "urn:schemas-upnp-org:service:AVTransport:1",
                &format!("{}/AVTransport/control", server.base_url()),
                "Play",
                "<InstanceID>0</InstanceID><Speed>1</Speed>",
                None,
                Duration::from_secs(5),
            )
            .await;

        mock.assert();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_soap_fault() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/AVTransport/control");
            then.status(500).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError><errorCode>718</errorCode><errorDescription>Invalid InstanceID</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#,
            );
        });
        let transport = SoapTransport::new(Client::new(), "test-agent".to_string(), "test".to_string());

        let result = transport
            .invoke(
                "urn:schemas-upnp-org:service:AVTransport:1",
                &format!("{}/AVTransport/control", server.base_url()),
                "Seek",
                "<InstanceID>0</InstanceID>",
                None,
                Duration::from_secs(5),
            )
            .await;

        match result {
            Err(DlnaError::SoapFault { error_code, .. }) => assert_eq!("718", error_code),
            other => panic!("expected a SoapFault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_xml() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/description.xml");
            then.status(200)
                .header("Content-Type", "text/xml")
                .body(r#"<root><device><friendlyName>test</friendlyName></device></root>"#);
        });
        let transport = SoapTransport::new(Client::new(), "test-agent".to_string(), "test".to_string());

        let map = transport
            .fetch_xml(&format!("{}/description.xml", server.base_url()))
            .await
            .unwrap();

        assert_eq!(Some(&"test".to_string()), map.get("friendlyName"));
    }
}
