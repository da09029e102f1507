//! ONVIF PTZ over SOAP 1.2.
//!
//! Setup asks the device service for its Media and PTZ service addresses,
//! takes the first media profile's token and binds a channel to it.
//! Requests carry a WS-Security UsernameToken digest when the camera has a
//! user configured.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use common::CameraProfile;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PanTilt, PtzChannel, PtzConnector};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

const GET_CAPABILITIES: &str =
    "<tds:GetCapabilities><tds:Category>All</tds:Category></tds:GetCapabilities>";
const GET_PROFILES: &str = "<trt:GetProfiles/>";

#[derive(Clone)]
struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    fn from_profile(profile: &CameraProfile) -> Option<Self> {
        if profile.user.is_empty() {
            None
        } else {
            Some(Self {
                user: profile.user.clone(),
                password: profile.password.clone(),
            })
        }
    }
}

/// Sets up ONVIF PTZ channels over HTTP.
#[derive(Clone)]
pub struct OnvifPtzConnector {
    http: reqwest::Client,
}

impl OnvifPtzConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .context("failed to build ONVIF http client")?;
        Ok(Self { http })
    }
}

pub fn device_service_url(profile: &CameraProfile) -> String {
    format!("http://{}:{}/onvif/device_service", profile.ip, profile.onvif_port)
}

#[async_trait]
impl PtzConnector for OnvifPtzConnector {
    async fn setup(&self, profile: &CameraProfile) -> Result<Box<dyn PtzChannel>> {
        let device_url = device_service_url(profile);
        let creds = Credentials::from_profile(profile);

        let (media_url, ptz_url) =
            match send_soap(&self.http, &device_url, GET_CAPABILITIES, creds.as_ref()).await {
                Ok(caps) => (
                    service_xaddr(&caps, "Media").unwrap_or_else(|| device_url.clone()),
                    service_xaddr(&caps, "PTZ").unwrap_or_else(|| device_url.clone()),
                ),
                Err(e) => {
                    warn!(camera = %profile.ip, error = %e, "GetCapabilities failed, using device service");
                    (device_url.clone(), device_url.clone())
                }
            };

        let profiles = send_soap(&self.http, &media_url, GET_PROFILES, creds.as_ref())
            .await
            .context("GetProfiles failed")?;
        let token = first_profile_token(&profiles)
            .ok_or_else(|| anyhow!("camera {} reported no media profiles", profile.ip))?;

        info!(camera = %profile.ip, ptz_url = %ptz_url, token = %token, "onvif ptz ready");
        Ok(Box::new(OnvifPtzChannel {
            http: self.http.clone(),
            ptz_url,
            token,
            creds,
        }))
    }
}

/// PTZ service of one camera, bound to a media profile token.
pub struct OnvifPtzChannel {
    http: reqwest::Client,
    ptz_url: String,
    token: String,
    creds: Option<Credentials>,
}

#[async_trait]
impl PtzChannel for OnvifPtzChannel {
    fn profile_token(&self) -> &str {
        &self.token
    }

    async fn continuous_move(&self, velocity: PanTilt) -> Result<()> {
        let body = continuous_move_body(&self.token, velocity);
        send_soap(&self.http, &self.ptz_url, &body, self.creds.as_ref())
            .await
            .context("ContinuousMove failed")?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let body = stop_body(&self.token);
        send_soap(&self.http, &self.ptz_url, &body, self.creds.as_ref())
            .await
            .context("Stop failed")?;
        Ok(())
    }
}

fn continuous_move_body(token: &str, velocity: PanTilt) -> String {
    format!(
        r#"<tptz:ContinuousMove><tptz:ProfileToken>{}</tptz:ProfileToken><tptz:Velocity><tt:PanTilt x="{}" y="{}"/></tptz:Velocity></tptz:ContinuousMove>"#,
        escape(token),
        velocity.x,
        velocity.y
    )
}

fn stop_body(token: &str) -> String {
    format!(
        "<tptz:Stop><tptz:ProfileToken>{}</tptz:ProfileToken><tptz:PanTilt>true</tptz:PanTilt><tptz:Zoom>true</tptz:Zoom></tptz:Stop>",
        escape(token)
    )
}

async fn send_soap(
    http: &reqwest::Client,
    url: &str,
    body: &str,
    creds: Option<&Credentials>,
) -> Result<String> {
    let envelope = build_envelope(body, creds.map(security_header).as_deref());
    debug!(url = %url, "sending ONVIF request");

    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
        .body(envelope)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    let text = response.text().await.context("failed to read ONVIF response")?;
    if !status.is_success() {
        return Err(anyhow!("ONVIF request to {url} failed: {status} {}", fault_reason(&text)));
    }
    Ok(text)
}

fn build_envelope(body: &str, header: Option<&str>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">{}<s:Body>{}</s:Body></s:Envelope>"#,
        header.unwrap_or_default(),
        body
    )
}

fn security_header(creds: &Credentials) -> String {
    let nonce: [u8; 16] = rand::random();
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    username_token(&creds.user, &creds.password, &nonce, &created)
}

/// WS-Security UsernameToken with a PasswordDigest.
fn username_token(user: &str, password: &str, nonce: &[u8], created: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    format!(
        r#"<s:Header><Security s:mustUnderstand="1" xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"><UsernameToken><Username>{}</Username><Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</Password><Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</Nonce><Created xmlns="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{}</Created></UsernameToken></Security></s:Header>"#,
        escape(user),
        password_digest(nonce, created, password),
        b64.encode(nonce),
        created
    )
}

/// base64(sha1(nonce ‖ created ‖ password))
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// `XAddr` of a service (`Media`, `PTZ`, ...) in a GetCapabilities response.
pub fn service_xaddr(xml: &str, service: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut service_depth: Option<usize> = None;
    let mut in_xaddr = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                let name = e.local_name();
                if service_depth.is_none() && name.as_ref() == service.as_bytes() {
                    service_depth = Some(depth);
                } else if service_depth.is_some() && name.as_ref() == b"XAddr" {
                    in_xaddr = true;
                }
            }
            Ok(Event::Text(t)) if in_xaddr => {
                return t
                    .unescape()
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
            }
            Ok(Event::End(_)) => {
                in_xaddr = false;
                if service_depth == Some(depth) {
                    service_depth = None;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// `token` attribute of the first `Profiles` element in a GetProfiles response.
pub fn first_profile_token(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Profiles" => {
                return token_attribute(&e);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn token_attribute(e: &BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == b"token")
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
        .filter(|v| !v.is_empty())
}

/// Text of a SOAP fault's `Reason`/`Text`, or the raw body when there is none.
fn fault_reason(xml: &str) -> String {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => in_text = e.local_name().as_ref() == b"Text",
            Ok(Event::Text(t)) if in_text => {
                if let Ok(text) = t.unescape() {
                    return text.into_owned();
                }
            }
            Ok(Event::End(_)) => in_text = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    xml.chars().take(200).collect()
}
