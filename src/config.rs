//! CLI surface of the lazy-pages daemon

use clap::Parser;
use std::path::PathBuf;

/// Userfault page server for lazy checkpoint restore
#[derive(Parser, Debug)]
#[command(name = "lazy-pages", version, about = "Userfault page server for lazy checkpoint restore")]
pub struct Cli {
    /// Fork and detach; the parent records the child pid and exits 0
    #[arg(long, short = 'd')]
    pub daemon: bool,

    /// Where the parent writes the daemon pid (also: LP_PIDFILE env var)
    #[arg(long, env = "LP_PIDFILE")]
    pub pidfile: Option<PathBuf>,

    /// Fetch page contents from a remote page server instead of the
    /// local pages image (also: LP_PAGE_SERVER env var)
    #[arg(long, env = "LP_PAGE_SERVER", value_name = "ADDR")]
    pub page_server: Option<String>,

    /// Directory holding the checkpoint images (also: LP_IMAGES_DIR env var)
    #[arg(long, short = 'D', env = "LP_IMAGES_DIR", default_value = ".")]
    pub images_dir: PathBuf,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["lazy-pages"]).unwrap();
        assert!(!cli.daemon);
        assert!(cli.pidfile.is_none());
        assert!(cli.page_server.is_none());
        assert_eq!(cli.images_dir, PathBuf::from("."));
    }

    #[test]
    fn test_daemon_with_pidfile() {
        let cli =
            Cli::try_parse_from(["lazy-pages", "-d", "--pidfile", "/run/lazy-pages.pid"]).unwrap();
        assert!(cli.daemon);
        assert_eq!(cli.pidfile.unwrap(), PathBuf::from("/run/lazy-pages.pid"));
    }

    #[test]
    fn test_page_server_selects_remote_reader() {
        let cli = Cli::try_parse_from(["lazy-pages", "--page-server", "10.0.0.2:9876"]).unwrap();
        assert_eq!(cli.page_server.as_deref(), Some("10.0.0.2:9876"));
    }

    #[test]
    fn test_images_dir_short_flag() {
        let cli = Cli::try_parse_from(["lazy-pages", "-D", "/tmp/imgs"]).unwrap();
        assert_eq!(cli.images_dir, PathBuf::from("/tmp/imgs"));
    }
}
