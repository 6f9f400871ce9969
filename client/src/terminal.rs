use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::session::{Intent, SessionSnapshot, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Intent(Intent),
    Quit,
}

pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Some(Command::Intent(Intent::Primary)),
        "d" | "detect" | "capture" => Some(Command::Intent(Intent::Capture)),
        "c" | "cancel" => Some(Command::Intent(Intent::Cancel)),
        "s" | "save" => Some(Command::Intent(Intent::Save)),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// Read commands from stdin and forward them as intents.
/// Returns when stdin closes or the user quits.
pub async fn read_commands(
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<SessionSnapshot>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("commands: [enter] detect/cancel, d detect, c cancel, s save, q quit");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        };

        let intent = match parse_command(&line) {
            Some(Command::Intent(intent)) => intent,
            Some(Command::Quit) => break,
            None => {
                println!("unknown command {:?}", line.trim());
                continue;
            }
        };

        let snapshot = snapshots.borrow().clone();
        if !accepts(&snapshot, intent) {
            println!("busy, waiting for the current detection");
            continue;
        }

        if intents.send(intent).await.is_err() {
            break;
        }
    }
    debug!("command reader finished");
}

/// Whether the front-end lets the intent through. Triggers are disabled
/// while a submission is in flight.
fn accepts(snapshot: &SessionSnapshot, intent: Intent) -> bool {
    match intent {
        Intent::Capture | Intent::Primary => snapshot.trigger_enabled,
        Intent::Cancel | Intent::Save => true,
    }
}

/// Turns snapshots into terminal output and the on-disk result image.
pub struct Renderer {
    display_path: PathBuf,
    last_view: Option<View>,
    last_error: Option<String>,
}

impl Renderer {
    pub fn new(display_path: PathBuf) -> Self {
        Self {
            display_path,
            last_view: None,
            last_error: None,
        }
    }

    /// Render one snapshot, returning the status line to print if anything changed.
    pub async fn render(&mut self, snapshot: &SessionSnapshot) -> std::io::Result<Option<String>> {
        let view_changed = self.last_view != Some(snapshot.view);
        let error_changed = self.last_error != snapshot.last_error;
        self.last_view = Some(snapshot.view);
        self.last_error = snapshot.last_error.clone();

        if !view_changed && !error_changed {
            return Ok(None);
        }

        let mut line = match snapshot.view {
            View::Idle => format!("[{}]", snapshot.primary_label),
            View::Capturing => "detecting...".to_string(),
            View::Showing { width, height } => {
                if view_changed {
                    if let Some(result) = &snapshot.result {
                        tokio::fs::write(&self.display_path, result.bytes()).await?;
                    }
                }
                let mut line = format!(
                    "showing {width}x{height} detection at {} [{}]",
                    self.display_path.display(),
                    snapshot.primary_label
                );
                if snapshot.can_save {
                    line.push_str(" [Save to Photos]");
                }
                line
            }
        };
        if let Some(err) = &snapshot.last_error {
            line.push_str(&format!(" (last attempt failed: {err})"));
        }
        Ok(Some(line))
    }
}

/// Print every snapshot the session publishes until it shuts down.
pub async fn render_loop(mut snapshots: watch::Receiver<SessionSnapshot>, mut renderer: Renderer) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        match renderer.render(&snapshot).await {
            Ok(Some(line)) => println!("{line}"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to write detection image"),
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CANCEL_LABEL, DETECT_LABEL};
    use crate::submit::DetectionImage;
    use bytes::Bytes;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn snapshot(view: View) -> SessionSnapshot {
        SessionSnapshot {
            view,
            trigger_enabled: view != View::Capturing,
            primary_label: if matches!(view, View::Showing { .. }) {
                CANCEL_LABEL
            } else {
                DETECT_LABEL
            },
            can_save: matches!(view, View::Showing { .. }),
            last_error: None,
            result: None,
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("d"), Some(Command::Intent(Intent::Capture)));
        assert_eq!(parse_command(" Detect \n"), Some(Command::Intent(Intent::Capture)));
        assert_eq!(parse_command("c"), Some(Command::Intent(Intent::Cancel)));
        assert_eq!(parse_command("save"), Some(Command::Intent(Intent::Save)));
        assert_eq!(parse_command(""), Some(Command::Intent(Intent::Primary)));
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command("launch"), None);
    }

    #[test]
    fn trigger_blocked_while_capturing() {
        let busy = snapshot(View::Capturing);
        assert!(!accepts(&busy, Intent::Capture));
        assert!(!accepts(&busy, Intent::Primary));
        assert!(accepts(&busy, Intent::Cancel));
        assert!(accepts(&snapshot(View::Idle), Intent::Capture));
    }

    #[tokio::test]
    async fn renders_only_on_change() {
        let mut renderer = Renderer::new(std::env::temp_dir().join("unused-detection.jpg"));
        let idle = snapshot(View::Idle);
        assert_eq!(
            renderer.render(&idle).await.unwrap().as_deref(),
            Some("[Detect Objects]")
        );
        assert_eq!(renderer.render(&idle).await.unwrap(), None);

        let mut failed = idle.clone();
        failed.last_error = Some("no frame available from the camera yet".into());
        let line = renderer.render(&failed).await.unwrap().unwrap();
        assert!(line.contains("last attempt failed"));

        let line = renderer.render(&snapshot(View::Capturing)).await.unwrap().unwrap();
        assert_eq!(line, "detecting...");
    }

    #[tokio::test]
    async fn showing_writes_display_image() {
        let path = std::env::temp_dir()
            .join(format!("detect-snap-display-{}.png", std::process::id()));
        let img = DynamicImage::ImageRgb8(RgbImage::new(3, 2));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        let detection = DetectionImage::decode(Bytes::from(buf.clone())).unwrap();

        let mut showing = snapshot(View::Showing { width: 3, height: 2 });
        showing.result = Some(detection);

        let mut renderer = Renderer::new(path.clone());
        let line = renderer.render(&showing).await.unwrap().unwrap();
        assert!(line.starts_with("showing 3x2"));
        assert!(line.ends_with("[Cancel] [Save to Photos]"));
        assert_eq!(std::fs::read(&path).unwrap(), buf);
        std::fs::remove_file(&path).unwrap();
    }
}
