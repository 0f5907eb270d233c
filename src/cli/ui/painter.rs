use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::model::DeviceConnectionState;

/// Applies colour and style to terminal text.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().cyan())
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().green())
    }

    pub(crate) fn warning<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().yellow())
    }

    pub(crate) fn failure<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().red())
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().dimmed())
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold())
    }

    /// Colours a connection state by severity.
    pub(crate) fn state(&self, state: &DeviceConnectionState) -> String {
        let text = state.to_string();
        match state {
            DeviceConnectionState::Syncing { .. } | DeviceConnectionState::Connected => {
                self.success(text)
            }
            DeviceConnectionState::Searching | DeviceConnectionState::Connecting => {
                self.value(text)
            }
            DeviceConnectionState::Unreachable => self.warning(text),
            DeviceConnectionState::Error { .. } => self.failure(text),
            DeviceConnectionState::Disconnected => self.muted(text),
        }
    }

    /// Renders a yes/no flag.
    pub(crate) fn flag(&self, value: bool) -> String {
        if value {
            self.success("yes")
        } else {
            self.muted("no")
        }
    }

    fn paint(&self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}
