//! Boot-time configuration parsed from the Multiboot2 command line:
//! `-o mlfqs` selects the MLFQ scheduler, the first remaining token names
//! the initial user program and the rest become its argv — mirroring the
//! reference kernel's own kernel command-line handling.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;
use lazy_static::lazy_static;

pub struct BootConfig {
    pub mlfqs: bool,
    pub init_program: Option<String>,
    pub init_args: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig { mlfqs: false, init_program: None, init_args: Vec::new() }
    }
}

lazy_static! {
    pub static ref CONFIG: Mutex<BootConfig> = Mutex::new(BootConfig::default());
}

/// Parse a raw command-line string as supplied by the bootloader/Multiboot2 tag.
pub fn parse(cmdline: &str) -> BootConfig {
    let mut tokens = cmdline.split_whitespace().peekable();
    let mut cfg = BootConfig::default();

    while let Some(tok) = tokens.next() {
        if tok == "-o" {
            if let Some(&opt) = tokens.peek() {
                if opt == "mlfqs" {
                    cfg.mlfqs = true;
                    tokens.next();
                    continue;
                }
            }
        } else if cfg.init_program.is_none() {
            cfg.init_program = Some(String::from(tok));
        } else {
            cfg.init_args.push(String::from(tok));
        }
    }
    cfg
}

pub fn init_from_cmdline(cmdline: &str) {
    let parsed = parse(cmdline);
    crate::log_info!(
        "boot config: mlfqs={} init_program={:?}",
        parsed.mlfqs, parsed.init_program
    );
    *CONFIG.lock() = parsed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn parses_mlfqs_flag() {
        let cfg = parse("-o mlfqs shell a b c");
        assert!(cfg.mlfqs);
        assert_eq!(cfg.init_program, Some("shell".to_string()));
        assert_eq!(cfg.init_args, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn defaults_without_flag() {
        let cfg = parse("hello x y");
        assert!(!cfg.mlfqs);
        assert_eq!(cfg.init_program, Some("hello".to_string()));
        assert_eq!(cfg.init_args, vec!["x".to_string(), "y".to_string()]);
    }
}
