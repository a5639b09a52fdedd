//! Partitioning-tool scripts rendered from embedded templates.
//!
//! Templates use the `#[name]` placeholder convention on top of the tool's own
//! scripting language. Placeholder names match property names
//! case-insensitively; a placeholder with no matching property is left as-is.

use crate::drive::Drive;
use diskenv_schema::{DiskFormat, DiskKind, PartitionStyle};
use std::fmt;
use std::path::PathBuf;

const PLACEHOLDER_OPEN: &str = "#[";
const PLACEHOLDER_CLOSE: char = ']';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptKind {
    Create,
    Attach,
    Detach,
    Compact,
}

impl ScriptKind {
    pub fn name(self) -> &'static str {
        match self {
            ScriptKind::Create => "create",
            ScriptKind::Attach => "attach",
            ScriptKind::Detach => "detach",
            ScriptKind::Compact => "compact",
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            ScriptKind::Create => include_str!("../templates/create.txt"),
            ScriptKind::Attach => include_str!("../templates/attach.txt"),
            ScriptKind::Detach => include_str!("../templates/detach.txt"),
            ScriptKind::Compact => include_str!("../templates/compact.txt"),
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub file: PathBuf,
    pub size_mb: u64,
    pub kind: DiskKind,
    pub style: PartitionStyle,
    pub format: DiskFormat,
    pub name: String,
    pub drive: Drive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    pub file: PathBuf,
    pub drive: Drive,
}

/// One invocation of the partitioning tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTask {
    Create(CreateParams),
    Attach(VolumeParams),
    Detach(VolumeParams),
    Compact(VolumeParams),
}

impl ScriptTask {
    pub fn kind(&self) -> ScriptKind {
        match self {
            ScriptTask::Create(_) => ScriptKind::Create,
            ScriptTask::Attach(_) => ScriptKind::Attach,
            ScriptTask::Detach(_) => ScriptKind::Detach,
            ScriptTask::Compact(_) => ScriptKind::Compact,
        }
    }

    pub fn file(&self) -> &PathBuf {
        match self {
            ScriptTask::Create(p) => &p.file,
            ScriptTask::Attach(p) | ScriptTask::Detach(p) | ScriptTask::Compact(p) => &p.file,
        }
    }

    pub fn drive(&self) -> Drive {
        match self {
            ScriptTask::Create(p) => p.drive,
            ScriptTask::Attach(p) | ScriptTask::Detach(p) | ScriptTask::Compact(p) => p.drive,
        }
    }

    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("file", self.file().display().to_string()),
            ("drive", self.drive().letter().to_string()),
        ];
        if let ScriptTask::Create(p) = self {
            props.push(("size", p.size_mb.to_string()));
            props.push(("type", p.kind.to_string()));
            props.push(("style", p.style.to_string()));
            props.push(("format", p.format.to_string()));
            props.push(("name", p.name.clone()));
        }
        props
    }

    pub fn render(&self) -> String {
        render_template(self.kind().template(), &self.properties())
    }
}

/// Substitute every `#[name]` placeholder that has a matching property.
pub fn render_template(template: &str, properties: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after_open.find(PLACEHOLDER_CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after_open[..end];
        match properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + PLACEHOLDER_OPEN.len() + end + 1]),
        }
        rest = &after_open[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> Drive {
        Drive::new('E').unwrap()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render_template(
            "select vdisk file=\"#[file]\"",
            &[("file", "C:\\envs\\dev.vhdx".to_owned())],
        );
        assert_eq!(out, "select vdisk file=\"C:\\envs\\dev.vhdx\"");
    }

    #[test]
    fn placeholder_names_are_case_insensitive() {
        let out = render_template("#[FILE] #[File] #[file]", &[("file", "x".to_owned())]);
        assert_eq!(out, "x x x");
    }

    #[test]
    fn unknown_placeholders_are_left_untouched() {
        let out = render_template("a #[missing] b #[name]", &[("name", "n".to_owned())]);
        assert_eq!(out, "a #[missing] b n");
    }

    #[test]
    fn unterminated_placeholder_is_kept_verbatim() {
        let out = render_template("x #[name", &[("name", "n".to_owned())]);
        assert_eq!(out, "x #[name");
    }

    #[test]
    fn values_are_not_rescanned() {
        let out = render_template("#[a]", &[("a", "#[b]".to_owned()), ("b", "no".to_owned())]);
        assert_eq!(out, "#[b]");
    }

    #[test]
    fn create_script_carries_every_parameter() {
        let task = ScriptTask::Create(CreateParams {
            file: PathBuf::from("C:\\envs\\dev.vhdx"),
            size_mb: 4096,
            kind: DiskKind::Expandable,
            style: PartitionStyle::Gpt,
            format: DiskFormat::Ntfs,
            name: "dev".to_owned(),
            drive: drive(),
        });
        let script = task.render();
        assert!(script.contains("create vdisk file=\"C:\\envs\\dev.vhdx\" maximum=4096 type=expandable"));
        assert!(script.contains("convert gpt"));
        assert!(script.contains("format fs=ntfs label=\"dev\" quick"));
        assert!(script.contains("assign letter=E"));
        assert!(!script.contains("#["));
    }

    #[test]
    fn volume_scripts_render_without_leftovers() {
        let params = VolumeParams {
            file: PathBuf::from("D:\\dev.vhdx"),
            drive: drive(),
        };
        for task in [
            ScriptTask::Attach(params.clone()),
            ScriptTask::Detach(params.clone()),
            ScriptTask::Compact(params.clone()),
        ] {
            let script = task.render();
            assert!(script.contains("select vdisk file=\"D:\\dev.vhdx\""));
            assert!(!script.contains("#["), "{} left a placeholder", task.kind());
        }
        assert!(ScriptTask::Compact(params).render().contains("compact vdisk"));
    }
}
