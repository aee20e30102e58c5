use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::{Body, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Everything the outgoing mail is built from.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment: Attachment,
}

/// Built message plus its formatted bytes, ready for the transport.
#[derive(Clone)]
pub struct Payload {
    message: Message,
    boundary: String,
    bytes: Vec<u8>,
}

impl Payload {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn sender(&self) -> Option<&Address> {
        self.message.envelope().from()
    }

    pub fn recipients(&self) -> &[Address] {
        self.message.envelope().to()
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("sender", &self.sender())
            .field("recipients", &self.recipients())
            .field("boundary", &self.boundary)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Builds a `multipart/mixed` message with a plain text part and one attachment.
///
/// Both parts are base64 encoded, so the body text and the attachment come back
/// byte for byte, line endings included.
pub fn build_message(message: &DispatchMessage) -> Result<Payload> {
    let sender = parse_address(&message.sender, "sender")?;
    if message.recipients.is_empty() {
        return Err(DeliveryError::InvalidRequest("no recipient given".to_string()));
    }
    let recipients = message
        .recipients
        .iter()
        .map(|r| parse_address(r, "recipient"))
        .collect::<Result<Vec<_>>>()?;

    let content_type = ContentType::parse(message.attachment.content_type.trim()).map_err(|e| {
        DeliveryError::InvalidRequest(format!(
            "invalid attachment content type '{}': {}",
            message.attachment.content_type, e
        ))
    })?;

    // '-' is outside the base64 alphabet, no encoded part can contain the boundary.
    let boundary = format!("invoice-{}", Uuid::new_v4().simple());
    let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), sender.domain());

    let text = SinglePart::builder()
        .header(ContentType::TEXT_PLAIN)
        .body(base64_body(message.body.clone().into_bytes())?);
    let attachment = lettre::message::Attachment::new(sanitize_header(&message.attachment.filename))
        .body(base64_body(message.attachment.content.clone())?, content_type);

    let builder = recipients.iter().fold(
        Message::builder()
            .from(Mailbox::new(None, sender.clone()))
            .subject(sanitize_header(&message.subject))
            .date_now()
            .message_id(Some(message_id)),
        |builder, recipient| builder.to(Mailbox::new(None, recipient.clone())),
    );

    let built = builder
        .multipart(MultiPart::mixed().boundary(boundary.clone()).singlepart(text).singlepart(attachment))
        .map_err(|e| DeliveryError::InvalidRequest(format!("message build failed: {}", e)))?;

    let bytes = built.formatted();
    Ok(Payload { message: built, boundary, bytes })
}

fn parse_address(raw: &str, role: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| DeliveryError::InvalidRequest(format!("invalid {} address '{}': {}", role, raw, e)))
}

fn base64_body(content: Vec<u8>) -> Result<Body> {
    Body::new_with_encoding(content, ContentTransferEncoding::Base64)
        .map_err(|_| DeliveryError::InvalidRequest("part cannot be base64 encoded".to_string()))
}

/// Header values never carry raw line breaks.
fn sanitize_header(value: &str) -> String {
    value.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> DispatchMessage {
        DispatchMessage {
            sender: "billing@example.com".to_string(),
            recipients: vec!["client@example.org".to_string()],
            subject: "Invoice INV-1".to_string(),
            body: "Hello,\nplease find the invoice attached.".to_string(),
            attachment: Attachment {
                filename: "INV-1.pdf".to_string(),
                content: b"%PDF-1.7 fake".to_vec(),
                content_type: "application/pdf".to_string(),
            },
        }
    }

    fn longest_line(bytes: &[u8]) -> usize {
        bytes.split(|b| *b == b'\n').map(<[u8]>::len).max().unwrap_or(0)
    }

    #[test]
    fn test_headers_and_parts() {
        let payload = build_message(&message()).unwrap();
        let text = String::from_utf8(payload.as_bytes().to_vec()).unwrap();

        assert!(text.contains("From: billing@example.com\r\n"));
        assert!(text.contains("To: client@example.org\r\n"));
        assert!(text.contains("Subject: Invoice INV-1\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Message-ID: <"));
        assert!(text.contains(payload.boundary()));
        assert!(text.contains("INV-1.pdf"));
        assert!(text.contains("Content-Transfer-Encoding: base64"));
        assert!(!text.contains("Content-Transfer-Encoding: 8bit"));
        assert_eq!(payload.recipients().len(), 1);
        assert_eq!(payload.sender().map(ToString::to_string).as_deref(), Some("billing@example.com"));
    }

    #[test]
    fn test_boundary_is_fresh_per_message() {
        let a = build_message(&message()).unwrap();
        let b = build_message(&message()).unwrap();
        assert_ne!(a.boundary(), b.boundary());
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let mut msg = message();
        msg.recipients.clear();
        assert!(matches!(build_message(&msg), Err(DeliveryError::InvalidRequest(_))));

        let mut msg = message();
        msg.recipients = vec!["not an address".to_string()];
        assert!(matches!(build_message(&msg), Err(DeliveryError::InvalidRequest(_))));

        let mut msg = message();
        msg.sender = String::new();
        assert!(matches!(build_message(&msg), Err(DeliveryError::InvalidRequest(_))));
    }

    #[test]
    fn test_invalid_content_type_is_rejected() {
        let mut msg = message();
        msg.attachment.content_type = "not a mime type".to_string();
        assert!(matches!(build_message(&msg), Err(DeliveryError::InvalidRequest(_))));
    }

    #[test]
    fn test_subject_injection_is_neutralised() {
        let mut msg = message();
        msg.subject = "Invoice\r\nBcc: attacker@example.net".to_string();
        let text = String::from_utf8(build_message(&msg).unwrap().as_bytes().to_vec()).unwrap();
        assert!(!text.contains("\r\nBcc:"));
    }

    #[test]
    fn test_long_body_lines_stay_within_limit() {
        let mut msg = message();
        msg.body = format!("{}\n", "x".repeat(2000));
        let payload = build_message(&msg).unwrap();
        assert!(longest_line(payload.as_bytes()) <= 998);
    }
}
