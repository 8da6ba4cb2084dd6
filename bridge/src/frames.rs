//! Control-transport frame formats.
//!
//! Inbound frames are small XML documents. The only element acted upon today
//! is `<Variable ID="...">value</Variable>`; anything else decodes as
//! [`InboundFrame::Unhandled`] so a newer Instance build cannot crash the
//! dispatcher. Outbound commands are the two fixed request shapes,
//! CRLF-terminated per the Instance control protocol.

use std::borrow::Cow;

use serde::Deserialize;
use thiserror::Error;

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Variable update pushed by an Instance.
    Variable { id: String, value: String },
    /// Well-formed XML carrying an element this build does not act upon.
    Unhandled { element: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no root element")]
    NoRoot,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct VariableFrame {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "$value", default)]
    value: String,
}

/// Parse one inbound frame.
pub fn parse(text: &str) -> Result<InboundFrame, FrameError> {
    let element = root_element(text).ok_or(FrameError::NoRoot)?;
    match element {
        "Variable" => {
            let frame: VariableFrame =
                serde_xml_rs::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
            Ok(InboundFrame::Variable {
                id: frame.id,
                value: frame.value,
            })
        }
        other => Ok(InboundFrame::Unhandled {
            element: other.to_string(),
        }),
    }
}

/// Name of the document's root element, skipping any XML declaration or
/// processing instructions.
fn root_element(text: &str) -> Option<&str> {
    let mut rest = text.trim_start();
    while let Some(stripped) = rest.strip_prefix("<?") {
        rest = stripped.split_once("?>")?.1.trim_start();
    }
    let body = rest.strip_prefix('<')?;
    let end = body.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    let name = &body[..end];
    (!name.is_empty()).then_some(name)
}

/// `<SetVariableValueRequest ID="...">VALUE</SetVariableValueRequest>` frame.
pub fn set_variable_request(variable_id: &str, value: &str) -> String {
    format!(
        "<SetVariableValueRequest ID=\"{}\">{}</SetVariableValueRequest>\r\n",
        escape(variable_id),
        escape(value)
    )
}

/// `<EvaluateManualMessagingRuleRequest ID="..."/>` frame.
pub fn evaluate_rule_request(rule_id: &str) -> String {
    format!(
        "<EvaluateManualMessagingRuleRequest ID=\"{}\"/>\r\n",
        escape(rule_id)
    )
}

fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}
