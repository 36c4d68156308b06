//! Wire protocol shared with the element generation service.
//!
//! The client sends exactly one [`StreamRequest`] after connecting; the server
//! answers with a sequence of [`ServerMessage::Element`] frames terminated by
//! one [`ServerMessage::Complete`] or [`ServerMessage::Error`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardMsg {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DimensionsMsg {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PageDimensionsMsg {
    pub dimensions: DimensionsMsg,
}

impl PageDimensionsMsg {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            dimensions: DimensionsMsg { width, height },
        }
    }
}

/// First and only outbound frame of a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRequest {
    pub card: CardMsg,
    pub page_dimensions: PageDimensionsMsg,
}

impl StreamRequest {
    pub fn new(card: CardMsg, page_dimensions: PageDimensionsMsg) -> Self {
        Self {
            card,
            page_dimensions,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Text,
    Image,
    Embed,
    Shape,
    Video,
}

impl ElementKind {
    /// Whether `ref` on this kind points at a media asset.
    pub fn carries_media(self) -> bool {
        matches!(self, Self::Image | Self::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Embed => "embed",
            Self::Shape => "shape",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One design element as emitted by the server.
///
/// Geometry is optional; the host places unpositioned elements itself. Keys
/// the SDK does not model (font size, colour, paths, ...) are kept in
/// `attributes` and re-emitted unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementDescriptor {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Image/video locator, replaced by the host reference once imported.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ElementDescriptor {
    pub fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            top: None,
            left: None,
            width: None,
            height: None,
            resource: None,
            children: Vec::new(),
            url: None,
            attributes: Map::new(),
        }
    }

    pub fn text(children: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            children: children.into_iter().map(Into::into).collect(),
            ..Self::new(ElementKind::Text)
        }
    }

    pub fn image(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Self::new(ElementKind::Image)
        }
    }

    pub fn with_position(mut self, top: f64, left: f64, width: f64, height: f64) -> Self {
        self.top = Some(top);
        self.left = Some(left);
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// External locator that must be imported before delivery, if any.
    ///
    /// Only `http`/`https` URLs on media kinds qualify; any other `ref` is
    /// assumed to already be a host reference.
    pub fn resource_locator(&self) -> Option<&str> {
        if !self.kind.carries_media() {
            return None;
        }
        let resource = self.resource.as_deref()?;
        let url = reqwest::Url::parse(resource).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(resource)
    }

    pub(crate) fn validate(&self) -> Result<(), DecodeError> {
        let geometry = [
            ("top", self.top),
            ("left", self.left),
            ("width", self.width),
            ("height", self.height),
        ];
        for (field, value) in geometry {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(DecodeError::InvalidElement(format!(
                        "{field} must be a finite number >= 0, got {value}"
                    )));
                }
            }
        }

        if self.kind.carries_media()
            && self.resource.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            return Err(DecodeError::InvalidElement(format!(
                "{} element is missing ref",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Decoded inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Element {
        index: u64,
        data: ElementDescriptor,
    },
    Complete {
        total_elements: u64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        let message: Self = serde_json::from_str(text)?;
        if let Self::Element { data, .. } = &message {
            data.validate()?;
        }
        Ok(message)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whether no further message is valid after this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Element { .. })
    }
}

/// Raw payload of one inbound websocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid element: {0}")]
    InvalidElement(String),
}

/// Decodes one inbound frame into a typed message.
pub fn decode_frame(frame: &StreamFrame) -> Result<ServerMessage, DecodeError> {
    match frame {
        StreamFrame::Text(text) => ServerMessage::from_text(text),
        StreamFrame::Binary(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
            ServerMessage::from_text(text)
        }
    }
}
