use diskenv_runtime::render_template;
use std::path::Path;
use tracing::debug;

const SETTINGS_DIR: &str = "Settings";
const TEMPLATE_SUFFIX: &str = ".template";

/// Render every `Settings/**/*.template` under `root` into the sibling file
/// without the suffix. Returns the number of files written.
pub fn mirror_settings(root: &Path, properties: &[(&str, String)]) -> std::io::Result<usize> {
    let dir = root.join(SETTINGS_DIR);
    if !dir.is_dir() {
        return Ok(0);
    }
    render_dir(&dir, properties)
}

fn render_dir(dir: &Path, properties: &[(&str, String)]) -> std::io::Result<usize> {
    let mut written = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            written += render_dir(&path, properties)?;
            continue;
        }
        let Some(target) = path
            .to_str()
            .and_then(|p| p.strip_suffix(TEMPLATE_SUFFIX))
            .filter(|t| !t.ends_with(['/', '\\']))
        else {
            continue;
        };
        let template = std::fs::read_to_string(&path)?;
        std::fs::write(target, render_template(&template, properties))?;
        debug!("rendered {target}");
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Vec<(&'static str, String)> {
        vec![
            ("drive", "E:".to_owned()),
            ("name", "dev".to_owned()),
            ("home", "E:\\Home".to_owned()),
        ]
    }

    #[test]
    fn renders_nested_templates() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("Settings");
        std::fs::create_dir_all(settings.join("git")).unwrap();
        std::fs::write(settings.join("app.ini.template"), "home=#[HOME]\nkeep=#[other]").unwrap();
        std::fs::write(settings.join("git/config.template"), "[core]\n  name = #[name]").unwrap();
        std::fs::write(settings.join("plain.ini"), "untouched").unwrap();

        assert_eq!(mirror_settings(dir.path(), &props()).unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(settings.join("app.ini")).unwrap(),
            "home=E:\\Home\nkeep=#[other]"
        );
        assert_eq!(
            std::fs::read_to_string(settings.join("git/config")).unwrap(),
            "[core]\n  name = dev"
        );
        assert_eq!(
            std::fs::read_to_string(settings.join("plain.ini")).unwrap(),
            "untouched"
        );
    }

    #[test]
    fn rerender_overwrites_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("Settings");
        std::fs::create_dir_all(&settings).unwrap();
        std::fs::write(settings.join("drive.txt.template"), "#[drive]").unwrap();
        std::fs::write(settings.join("drive.txt"), "F:").unwrap();

        mirror_settings(dir.path(), &props()).unwrap();
        assert_eq!(std::fs::read_to_string(settings.join("drive.txt")).unwrap(), "E:");
    }

    #[test]
    fn missing_settings_dir_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(mirror_settings(dir.path(), &props()).unwrap(), 0);
    }
}
