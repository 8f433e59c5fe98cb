//! Terminal rendering of stream events

use clap::ValueEnum;
use flowgraph_core::StreamEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Line to print for `event`, if any
pub fn render(event: &StreamEvent, format: OutputFormat) -> Option<String> {
    match format {
        OutputFormat::Json => serde_json::to_string(event).ok(),
        OutputFormat::Text => match event {
            StreamEvent::Progress(p) => Some(format!("[{:>3}%]", p)),
            StreamEvent::Status(line) => Some(format!("» {}", line)),
            StreamEvent::Fragment(text) => Some(format!("{}\n", text)),
            StreamEvent::Done => None,
        },
    }
}
