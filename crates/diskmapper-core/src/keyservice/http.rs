//! HTTP(S) transport to the key broker.

use super::{KeyBroker, KeyRequest};
use crate::config::DiskMapperConfig;
use crate::error::{DiskMapperError, DiskMapperResult};
use crate::passphrase::Passphrase;
use log::debug;
use reqwest::blocking::Client;
use reqwest::{Certificate, StatusCode, Url};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use zeroize::Zeroizing;

const KEY_PATH: &str = "v1/state-disk/key";

#[derive(Deserialize)]
struct KeyResponse {
    passphrase: String,
}

#[derive(Deserialize)]
struct Rejection {
    #[serde(default)]
    reason: Option<String>,
}

/// Broker client that tries each configured endpoint in order.
#[derive(Debug, Clone)]
pub struct HttpKeyBroker {
    client: Client,
    endpoints: Vec<Url>,
}

impl HttpKeyBroker {
    pub fn new(
        endpoints: &[String],
        timeout: Duration,
        ca_cert_path: Option<&Path>,
    ) -> DiskMapperResult<Self> {
        if endpoints.is_empty() {
            return Err(DiskMapperError::InvalidConfig(
                "broker.endpoints must list at least one key broker".into(),
            ));
        }

        let endpoints = endpoints
            .iter()
            .map(|raw| key_url(raw))
            .collect::<DiskMapperResult<Vec<_>>>()?;

        let mut builder = Client::builder().timeout(timeout);
        if let Some(path) = ca_cert_path {
            let pem = fs::read(path).map_err(|err| {
                DiskMapperError::InvalidConfig(format!(
                    "reading broker CA bundle {}: {err}",
                    path.display()
                ))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|err| {
                DiskMapperError::InvalidConfig(format!(
                    "parsing broker CA bundle {}: {err}",
                    path.display()
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|err| {
            DiskMapperError::InvalidConfig(format!("building broker HTTP client: {err}"))
        })?;

        Ok(Self { client, endpoints })
    }

    pub fn from_config(config: &DiskMapperConfig) -> DiskMapperResult<Self> {
        Self::new(
            &config.broker.endpoints,
            config.request_timeout(),
            config.broker.ca_cert_path.as_deref(),
        )
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    fn post(&self, url: &Url, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        let response = self
            .client
            .post(url.clone())
            .json(request)
            .send()
            .map_err(|err| DiskMapperError::BrokerUnavailable(format!("{url}: {err}")))?;

        let status = response.status();
        let body = Zeroizing::new(response.text().map_err(|err| {
            DiskMapperError::BrokerUnavailable(format!("{url}: reading response: {err}"))
        })?);

        match status {
            StatusCode::OK => {
                let parsed: KeyResponse = serde_json::from_str(&body).map_err(|_| {
                    DiskMapperError::BrokerUnavailable(format!("{url}: malformed key response"))
                })?;
                let encoded = Zeroizing::new(parsed.passphrase);
                Passphrase::from_hex(&encoded)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let reason = serde_json::from_str::<Rejection>(&body)
                    .ok()
                    .and_then(|r| r.reason)
                    .unwrap_or_else(|| status.to_string());
                Err(DiskMapperError::KeyRejected(format!("{url}: {reason}")))
            }
            other => Err(DiskMapperError::BrokerUnavailable(format!(
                "{url} returned {other}"
            ))),
        }
    }
}

impl KeyBroker for HttpKeyBroker {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        let mut first_error = None;
        for url in &self.endpoints {
            match self.post(url, request) {
                Ok(passphrase) => return Ok(passphrase),
                Err(err) => {
                    debug!("key broker {url} did not release a key: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| {
            DiskMapperError::BrokerUnavailable("no key broker endpoints configured".into())
        }))
    }
}

fn key_url(raw: &str) -> DiskMapperResult<Url> {
    let mut base = Url::parse(raw.trim()).map_err(|err| {
        DiskMapperError::InvalidConfig(format!("invalid broker endpoint {raw:?}: {err}"))
    })?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(KEY_PATH).map_err(|err| {
        DiskMapperError::InvalidConfig(format!("invalid broker endpoint {raw:?}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskmapper_provider::{AttestationQuote, InstanceMetadata, Platform};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned response per queued entry, returning the request bodies.
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut bodies = Vec::new();
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0usize;
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                assert!(request_line.starts_with("POST /v1/state-disk/key"), "{request_line}");
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut payload = vec![0u8; content_length];
                reader.read_exact(&mut payload).unwrap();
                bodies.push(String::from_utf8(payload).unwrap());

                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
            }
            bodies
        });
        (format!("http://{addr}"), handle)
    }

    fn request() -> KeyRequest {
        KeyRequest {
            disk_uuid: "4f6d0a52-0000-4000-8000-000000000abc".into(),
            nonce: vec![0xab; 4],
            quote: AttestationQuote {
                platform: Platform::Azure,
                message: vec![1, 2],
                signature: vec![3],
                ak_public: vec![4],
                ak_cert: Some(vec![5]),
                qualifying_data: vec![6],
                pcrs: Vec::new(),
            },
            metadata: InstanceMetadata {
                name: "worker-1".into(),
                provider_id: "azure:///subscriptions/x/worker-1".into(),
                region: "westeurope".into(),
                private_ips: vec!["10.0.0.7".into()],
            },
        }
    }

    fn broker(endpoints: Vec<String>) -> HttpKeyBroker {
        HttpKeyBroker::new(&endpoints, Duration::from_secs(5), None).unwrap()
    }

    #[test]
    fn accepted_request_returns_decoded_passphrase() {
        let (url, server) = serve(vec![(200, r#"{"passphrase":"6b6579"}"#)]);
        let passphrase = broker(vec![url]).request_key(&request()).unwrap();
        assert_eq!(passphrase.as_bytes(), b"key");

        let bodies = server.join().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent["disk_uuid"], "4f6d0a52-0000-4000-8000-000000000abc");
        assert_eq!(sent["nonce"], "abababab");
        assert_eq!(sent["quote"]["platform"], "azure");
        assert_eq!(sent["quote"]["ak_cert"], "05");
        assert_eq!(sent["metadata"]["private_ips"][0], "10.0.0.7");
    }

    #[test]
    fn forbidden_maps_to_rejection_with_reason() {
        let (url, server) = serve(vec![(403, r#"{"reason":"pcr 7 mismatch"}"#)]);
        let err = broker(vec![url]).request_key(&request()).unwrap_err();
        server.join().unwrap();
        match err {
            DiskMapperError::KeyRejected(reason) => assert!(reason.contains("pcr 7 mismatch")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn later_endpoint_is_used_when_the_first_fails() {
        let (first, first_server) = serve(vec![(503, "")]);
        let (second, second_server) = serve(vec![(200, r#"{"passphrase":"00ff"}"#)]);
        let passphrase = broker(vec![first, second]).request_key(&request()).unwrap();
        assert_eq!(passphrase.as_bytes(), &[0x00, 0xff]);
        first_server.join().unwrap();
        second_server.join().unwrap();
    }

    #[test]
    fn first_error_is_reported_when_every_endpoint_fails() {
        let (first, first_server) = serve(vec![(401, "")]);
        let (second, second_server) = serve(vec![(500, "")]);
        let err = broker(vec![first, second]).request_key(&request()).unwrap_err();
        first_server.join().unwrap();
        second_server.join().unwrap();
        assert!(matches!(err, DiskMapperError::KeyRejected(_)), "{err}");
    }

    #[test]
    fn malformed_success_body_is_unavailability() {
        let (url, server) = serve(vec![(200, r#"{"key":"nope"}"#)]);
        let err = broker(vec![url]).request_key(&request()).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, DiskMapperError::BrokerUnavailable(_)));
    }

    #[test]
    fn endpoint_paths_are_preserved() {
        let url = key_url("https://kms.example:8443/tenant-a").unwrap();
        assert_eq!(url.as_str(), "https://kms.example:8443/tenant-a/v1/state-disk/key");
        let url = key_url("http://10.0.0.1:9000").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:9000/v1/state-disk/key");
        assert!(HttpKeyBroker::new(&[], Duration::from_secs(1), None).is_err());
    }
}
