use std::{collections::HashMap, path::Path};

use gangway_core::ControlError;
use http::StatusCode;

/// Error page templates loaded from a service's `error_page_path`.
///
/// The directory holds `<status>.html` files; `{{message}}` inside a
/// template is replaced at render time (the stop message, mostly). Loading
/// happens once per options update, never per request.
#[derive(Debug)]
pub struct ErrorPages {
    pages: HashMap<u16, String>,
}

impl ErrorPages {
    pub fn load(dir: &Path) -> Result<Self, ControlError> {
        let entries = std::fs::read_dir(dir).map_err(|_| ControlError::UnableToLoadErrorPages)?;
        let mut pages = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|_| ControlError::UnableToLoadErrorPages)?;
            let name = entry.file_name();
            let Some(code) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".html"))
                .and_then(|n| n.parse::<u16>().ok())
            else {
                continue;
            };
            if !(400..=599).contains(&code) {
                continue;
            }
            let body = std::fs::read_to_string(entry.path())
                .map_err(|_| ControlError::UnableToLoadErrorPages)?;
            pages.insert(code, body);
        }
        Ok(Self { pages })
    }

    pub fn render(&self, status: StatusCode, message: Option<&str>) -> Option<String> {
        self.pages
            .get(&status.as_u16())
            .map(|template| template.replace("{{message}}", message.unwrap_or("")))
    }
}

/// Built-in fallback for proxy-generated errors when no custom page covers
/// the status.
pub fn default_page(status: StatusCode, message: Option<&str>) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    let code = status.as_u16();
    let detail = message.unwrap_or("");
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{code} {reason}</title></head>\n\
         <body>\n<h1>{reason}</h1>\n<p>{detail}</p>\n</body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pages_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gangway-error-pages-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_and_renders_templates() {
        let dir = temp_pages_dir();
        std::fs::write(dir.join("503.html"), "<h1>down: {{message}}</h1>").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let pages = ErrorPages::load(&dir).unwrap();
        assert_eq!(
            pages
                .render(StatusCode::SERVICE_UNAVAILABLE, Some("maintenance"))
                .unwrap(),
            "<h1>down: maintenance</h1>"
        );
        assert!(pages.render(StatusCode::GATEWAY_TIMEOUT, None).is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let missing = std::env::temp_dir().join("gangway-no-such-pages-dir");
        assert_eq!(
            ErrorPages::load(&missing).unwrap_err(),
            ControlError::UnableToLoadErrorPages
        );
    }

    #[test]
    fn default_page_carries_message() {
        let html = default_page(StatusCode::SERVICE_UNAVAILABLE, Some("maintenance"));
        assert!(html.contains("503"));
        assert!(html.contains("maintenance"));
    }
}
