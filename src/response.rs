//! Parsing of the collector's XML replies

use crate::errors::{PipelineError, Result};
use quick_xml::Reader;
use quick_xml::events::Event;

/// Top-level error code for a batch that repeats an entry id
pub const DUPLICATE_IDS_CODE: &str = "AWS.SimpleQueueService.BatchEntryIdsNotDistinct";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<BatchErrorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchErrorEntry {
    pub id: String,
    /// The entry itself was bad; resending it cannot help
    pub sender_fault: bool,
    pub code: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error_type: String,
    pub code: String,
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn is_sender_fault(&self) -> bool {
        self.error_type.eq_ignore_ascii_case("Sender")
    }

    pub fn is_duplicate_ids(&self) -> bool {
        self.is_sender_fault() && self.code == DUPLICATE_IDS_CODE
    }
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }

    /// Depth-first search, self included
    fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}

fn parse_tree(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Element::default()];

    loop {
        match reader.read_event()? {
            Event::Start(e) => stack.push(Element {
                name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                ..Element::default()
            }),
            Event::Empty(e) => {
                let element = Element {
                    name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                    ..Element::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(PipelineError::Xml("unbalanced closing tag".to_string()));
                }
                if let Some(element) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| PipelineError::Xml(e.to_string()))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(PipelineError::Xml("document ended inside an element".to_string()));
    }
    stack
        .pop()
        .ok_or_else(|| PipelineError::Xml("empty document".to_string()))
}

/// Parse a successful `SendMessageBatch` reply.
pub fn parse_batch_result(xml: &str) -> Result<BatchResult> {
    let root = parse_tree(xml)?;
    let result = root
        .find("SendMessageBatchResult")
        .ok_or_else(|| PipelineError::Xml("missing SendMessageBatchResult".to_string()))?;

    let mut parsed = BatchResult::default();

    for entry in &result.children {
        match entry.name.as_str() {
            "SendMessageBatchResultEntry" => {
                if let Some(id) = entry.child_text("Id") {
                    parsed.successful.push(id.to_string());
                }
            }
            "BatchResultErrorEntry" => {
                let Some(id) = entry.child_text("Id") else {
                    continue;
                };
                parsed.failed.push(BatchErrorEntry {
                    id: id.to_string(),
                    sender_fault: entry
                        .child_text("SenderFault")
                        .is_some_and(|v| v.eq_ignore_ascii_case("true")),
                    code: entry.child_text("Code").unwrap_or_default().to_string(),
                    message: entry.child_text("Message").map(str::to_string),
                });
            }
            _ => {}
        }
    }

    Ok(parsed)
}

/// Parse a top-level `ErrorResponse` reply.
pub fn parse_error_response(xml: &str) -> Result<ErrorResponse> {
    let root = parse_tree(xml)?;
    let error = root
        .find("ErrorResponse")
        .and_then(|r| r.child("Error"))
        .ok_or_else(|| PipelineError::Xml("missing ErrorResponse/Error".to_string()))?;

    Ok(ErrorResponse {
        error_type: error.child_text("Type").unwrap_or_default().to_string(),
        code: error.child_text("Code").unwrap_or_default().to_string(),
        message: error.child_text("Message").map(str::to_string),
    })
}
