use std::{borrow::Cow, fmt::Display, path::Path};

/// One word of the QEMU command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QemuArg {
    text: String,
    /// Shell command substitutions appended unescaped, e.g. `$(nic_speed 1000)`.
    probes: String,
}

/// Ordered QEMU options, rendered into the start script's `CMD=` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QemuOptions {
    args: Vec<QemuArg>,
}

impl QemuOptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, text: impl Into<String>) -> &mut Self {
        self.args.push(QemuArg {
            text: text.into(),
            probes: String::new(),
        });
        self
    }

    /// Add `-{key}` with no value.
    pub fn flag(&mut self, key: &str) -> &mut Self {
        self.push(format!("-{key}"))
    }

    /// Add `-{key} {value}`.
    pub fn opt(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.push(format!("-{key}")).push(value.to_string())
    }

    /// Add `-{key} {value}` where the value ends in runtime probes.
    pub fn opt_with_probes(&mut self, key: &str, value: impl Display, probes: String) -> &mut Self {
        self.push(format!("-{key}"));
        self.args.push(QemuArg {
            text: value.to_string(),
            probes,
        });
        self
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        self.opt("name", format!("{name},debug-threads=on"))
    }

    pub fn uuid(&mut self, uuid: &str) -> &mut Self {
        self.opt("uuid", uuid)
    }

    pub fn chardev(&mut self, chardev: impl Display) -> &mut Self {
        self.opt("chardev", chardev)
    }

    pub fn device(&mut self, device: impl Display) -> &mut Self {
        self.opt("device", device)
    }

    pub fn object(&mut self, object: impl Display) -> &mut Self {
        self.opt("object", object)
    }

    pub fn drive(&mut self, drive: impl Display) -> &mut Self {
        self.opt("drive", drive)
    }

    /// Read-only UEFI code flash.
    pub fn uefi_pflash(&mut self, code_path: &Path) -> &mut Self {
        self.drive(format!(
            "if=pflash,format=raw,unit=0,file={},readonly=on",
            code_path.display()
        ))
    }

    pub fn bios(&mut self, path: &Path) -> &mut Self {
        self.opt("bios", path.display())
    }

    pub fn nodefaults(&mut self) -> &mut Self {
        self.flag("nodefaults")
    }

    pub fn numa_memdev(&mut self, memdev: &str) -> &mut Self {
        self.opt("numa", format!("node,memdev={memdev}"))
    }

    pub fn vnc(&mut self, vnc_port: u16, password: bool) -> &mut Self {
        if password {
            self.opt("vnc", format!(":{vnc_port},password=on"))
        } else {
            self.opt("vnc", format!(":{vnc_port}"))
        }
    }

    pub fn spice(&mut self, port: u16) -> &mut Self {
        self.opt("spice", format!("port={port},disable-ticketing=on"))
    }

    pub fn incoming(&mut self, uri: &str) -> &mut Self {
        self.opt("incoming", uri)
    }

    /// Words as QEMU receives them, probes left unexpanded.
    pub fn to_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| format!("{}{}", arg.text, arg.probes))
            .collect()
    }

    /// Escaped for use inside a double-quoted shell string.
    pub fn to_script(&self) -> String {
        self.args
            .iter()
            .map(|arg| format!("{}{}", escape_in_double_quotes(&arg.text), arg.probes))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn escape_in_double_quotes(word: &str) -> String {
    let word: Cow<'_, str> = if word.is_empty() || word.contains(char::is_whitespace) {
        shell_escape::escape(word.into())
    } else {
        word.into()
    };
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
