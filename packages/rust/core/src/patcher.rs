//! Template patcher.
//!
//! Seeds a job-exclusive copy of the read-only template, merges the staged
//! upload into it, and rewrites the identifying fields of the manifest and
//! build descriptor.
//!
//! Substitution is literal but single-pass: every placeholder of a file is
//! matched in one left-to-right scan, so an inserted value is never scanned
//! again and cannot be mistaken for another placeholder. A stamp file records
//! which settings were applied; re-applying them is a no-op.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use webapk_shared::{ProjectSettings, Result, TemplateConfig, WebApkError};

use crate::fsutil;

/// Stamp written at the instance root after a successful patch.
pub const PATCH_STAMP_FILE: &str = ".webapk-patch.json";

#[derive(Debug, Serialize, Deserialize)]
struct PatchStamp {
    settings_sha256: String,
}

/// What the patch step changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Manifest found and rewritten.
    pub manifest_patched: bool,
    /// Build descriptor found and rewritten.
    pub descriptor_patched: bool,
    /// Default icon replaced by the project's icon.
    pub icon_replaced: bool,
    /// Total placeholder occurrences substituted.
    pub replacements: usize,
    /// The instance already carried these settings; nothing was touched.
    pub already_applied: bool,
}

/// Seed `instance` with a fresh copy of the template source.
#[instrument(skip_all, fields(instance = %instance.display()))]
pub fn seed_instance(template_dir: &Path, instance: &Path) -> Result<usize> {
    if !template_dir.is_dir() {
        return Err(WebApkError::config(format!(
            "template source {} is not a directory",
            template_dir.display()
        )));
    }

    fsutil::reset_dir(instance)?;
    let files = fsutil::copy_dir_all(template_dir, instance)?;
    debug!(files, "template instance seeded");
    Ok(files)
}

/// Copy the staged upload into `<instance>/<merge_subdir>`, overwriting
/// same-named entries.
pub fn merge_workspace(workspace: &Path, instance: &Path, merge_subdir: &Path) -> Result<usize> {
    let target = instance.join(merge_subdir);
    let files = fsutil::copy_dir_all(workspace, &target)?;
    info!(files, target = %target.display(), "workspace merged into template");
    Ok(files)
}

/// Apply `settings` to the template instance.
///
/// A missing manifest or build descriptor is skipped with a warning. An icon
/// that cannot be found leaves the bundled default in place. Patching an
/// instance that already carries different settings is a [`WebApkError::Patch`].
#[instrument(skip_all, fields(instance = %instance.display(), package = %settings.package_name))]
pub fn patch(
    instance: &Path,
    template: &TemplateConfig,
    settings: &ProjectSettings,
) -> Result<PatchReport> {
    let fingerprint = settings_fingerprint(settings)?;
    let stamp_path = instance.join(PATCH_STAMP_FILE);

    if let Some(stamp) = read_stamp(&stamp_path)? {
        if stamp.settings_sha256 == fingerprint {
            debug!("settings already applied, skipping");
            return Ok(PatchReport {
                already_applied: true,
                ..PatchReport::default()
            });
        }
        return Err(WebApkError::patch(format!(
            "{} was already patched with different settings",
            instance.display()
        )));
    }

    let mut report = PatchReport::default();

    // The name lands inside an XML attribute; package and version are
    // restricted to characters that need no escaping.
    let label = xml_escape(&settings.app_name);
    let manifest = instance.join(&template.manifest_path);
    if let Some(count) = patch_file(
        &manifest,
        &[
            (&template.package_placeholder, &settings.package_name),
            (&template.name_placeholder, &label),
        ],
    )? {
        report.manifest_patched = true;
        report.replacements += count;
    }

    let descriptor = instance.join(&template.build_descriptor_path);
    if let Some(count) = patch_file(
        &descriptor,
        &[(&template.version_placeholder, &settings.version)],
    )? {
        report.descriptor_patched = true;
        report.replacements += count;
    }

    if let Some(icon) = &settings.icon {
        if icon.is_file() {
            let target = instance.join(&template.icon_path);
            fsutil::copy_file_atomic(icon, &target)?;
            report.icon_replaced = true;
            info!(icon = %icon.display(), "app icon applied");
        } else {
            warn!(icon = %icon.display(), "icon not found, keeping template default");
        }
    }

    fsutil::write_json(
        &stamp_path,
        &PatchStamp {
            settings_sha256: fingerprint,
        },
    )?;

    info!(
        manifest = report.manifest_patched,
        descriptor = report.descriptor_patched,
        icon = report.icon_replaced,
        replacements = report.replacements,
        "template patched"
    );

    Ok(report)
}

/// Replace every placeholder occurrence in `content` in a single scan.
///
/// At each position the earliest match wins; among matches starting at the
/// same position the longest placeholder wins. Empty placeholders are ignored.
/// Returns the new content and the number of substitutions.
pub fn substitute(content: &str, pairs: &[(&str, &str)]) -> (String, usize) {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    let mut count = 0;

    loop {
        let next = pairs
            .iter()
            .filter(|(token, _)| !token.is_empty())
            .filter_map(|(token, value)| rest.find(token).map(|at| (at, *token, *value)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())));

        match next {
            Some((at, token, value)) => {
                out.push_str(&rest[..at]);
                out.push_str(value);
                rest = &rest[at + token.len()..];
                count += 1;
            }
            None => {
                out.push_str(rest);
                return (out, count);
            }
        }
    }
}

/// Escape the five XML special characters.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Patch one file in place. `None` when the file does not exist.
fn patch_file(path: &Path, pairs: &[(&String, &String)]) -> Result<Option<usize>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "configuration file missing, substitution skipped");
            return Ok(None);
        }
        Err(e) => return Err(WebApkError::io(path, e)),
    };

    let pairs: Vec<(&str, &str)> = pairs.iter().map(|(t, v)| (t.as_str(), v.as_str())).collect();
    let (patched, count) = substitute(&content, &pairs);

    if count == 0 {
        warn!(path = %path.display(), "no placeholders found");
    } else {
        fs::write(path, patched).map_err(|e| WebApkError::io(path, e))?;
        debug!(path = %path.display(), count, "placeholders substituted");
    }

    Ok(Some(count))
}

fn settings_fingerprint(settings: &ProjectSettings) -> Result<String> {
    let bytes = serde_json::to_vec(settings)
        .map_err(|e| WebApkError::patch(format!("cannot fingerprint settings: {e}")))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn read_stamp(path: &Path) -> Result<Option<PatchStamp>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(WebApkError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| WebApkError::patch(format!("unreadable patch stamp {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DEFAULT_ICON, settings, temp_dir, write_template};

    fn seeded(tmp: &Path) -> std::path::PathBuf {
        let template = tmp.join("template");
        write_template(&template);
        let instance = tmp.join("instance");
        seed_instance(&template, &instance).unwrap();
        instance
    }

    fn read(path: impl AsRef<Path>) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn substitute_is_single_pass() {
        // The inserted package contains the name token; it must not be rewritten.
        let (out, n) = substitute(
            "pkg=com.example.app label=APP_NAME",
            &[("com.example.app", "org.APP_NAME.x"), ("APP_NAME", "Demo")],
        );
        assert_eq!(out, "pkg=org.APP_NAME.x label=Demo");
        assert_eq!(n, 2);
    }

    #[test]
    fn substitute_prefers_longest_token_at_same_position() {
        let (out, _) = substitute("A_B", &[("A", "x"), ("A_B", "y")]);
        assert_eq!(out, "y");

        let (out, n) = substitute("nothing here", &[("", "x"), ("TOKEN", "y")]);
        assert_eq!(out, "nothing here");
        assert_eq!(n, 0);
    }

    #[test]
    fn seed_requires_template_directory() {
        let tmp = temp_dir("patcher");
        let err = seed_instance(&tmp.join("missing"), &tmp.join("instance")).unwrap_err();
        assert!(matches!(err, WebApkError::Config { .. }));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn patch_rewrites_manifest_and_descriptor() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();

        let report = patch(&instance, &template, &settings()).unwrap();
        assert!(report.manifest_patched);
        assert!(report.descriptor_patched);
        assert!(!report.icon_replaced);
        // package + name in the manifest, version in build.gradle
        assert_eq!(report.replacements, 3);

        let manifest = read(instance.join(&template.manifest_path));
        assert!(manifest.contains(r#"package="com.demo.app""#));
        assert!(manifest.contains(r#"android:label="Demo""#));
        assert!(!manifest.contains("APP_NAME"));

        let gradle = read(instance.join(&template.build_descriptor_path));
        assert!(gradle.contains(r#"versionName "2.0.0""#));
        // Only the manifest carries the package placeholder contract.
        assert!(gradle.contains(r#"applicationId "com.example.app""#));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn app_name_is_escaped_in_manifest() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();
        let mut s = settings();
        s.app_name = r#"Tom "&" Jerry <3"#.into();

        patch(&instance, &template, &s).unwrap();

        let manifest = read(instance.join(&template.manifest_path));
        assert!(
            manifest.contains(r#"android:label="Tom &quot;&amp;&quot; Jerry &lt;3""#),
            "manifest was {manifest}"
        );
        assert!(!manifest.contains("<3"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn xml_escape_handles_specials() {
        assert_eq!(xml_escape("Plain App"), "Plain App");
        assert_eq!(xml_escape("Tom's <b>&</b>"), "Tom&apos;s &lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn patch_is_idempotent() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();

        patch(&instance, &template, &settings()).unwrap();
        let manifest_once = read(instance.join(&template.manifest_path));
        let gradle_once = read(instance.join(&template.build_descriptor_path));

        let again = patch(&instance, &template, &settings()).unwrap();
        assert!(again.already_applied);
        assert_eq!(read(instance.join(&template.manifest_path)), manifest_once);
        assert_eq!(read(instance.join(&template.build_descriptor_path)), gradle_once);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn repatching_with_other_settings_is_a_patch_error() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();

        patch(&instance, &template, &settings()).unwrap();

        let mut other = settings();
        other.version = "3.0.0".into();
        let err = patch(&instance, &template, &other).unwrap_err();
        assert!(matches!(err, WebApkError::Patch { .. }));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_config_files_are_skipped() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();
        fs::remove_file(instance.join(&template.manifest_path)).unwrap();

        let report = patch(&instance, &template, &settings()).unwrap();
        assert!(!report.manifest_patched);
        assert!(report.descriptor_patched);
        assert!(!instance.join(&template.manifest_path).exists());

        fs::remove_file(instance.join(&template.build_descriptor_path)).unwrap();
        let fresh = tmp.join("fresh");
        seed_instance(&instance, &fresh).unwrap();
        fs::remove_file(fresh.join(PATCH_STAMP_FILE)).unwrap();
        let report = patch(&fresh, &template, &settings()).unwrap();
        assert!(!report.manifest_patched);
        assert!(!report.descriptor_patched);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn icon_overrides_default_when_resolvable() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();

        let icon = tmp.join("icon.png");
        fs::write(&icon, b"custom-icon").unwrap();
        let mut s = settings();
        s.icon = Some(icon);

        let report = patch(&instance, &template, &s).unwrap();
        assert!(report.icon_replaced);
        assert_eq!(fs::read(instance.join(&template.icon_path)).unwrap(), b"custom-icon");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unresolvable_icon_keeps_default() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let template = TemplateConfig::default();

        let mut s = settings();
        s.icon = Some(tmp.join("nope.png"));

        let report = patch(&instance, &template, &s).unwrap();
        assert!(!report.icon_replaced);
        assert_eq!(fs::read(instance.join(&template.icon_path)).unwrap(), DEFAULT_ICON);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn merge_overwrites_template_entries() {
        let tmp = temp_dir("patcher");
        let instance = seeded(&tmp);
        let ws = tmp.join("ws");
        fs::create_dir_all(ws.join("src/main/assets")).unwrap();
        fs::write(ws.join("src/main/assets/index.html"), "<h1>app</h1>").unwrap();
        fs::write(ws.join("build.gradle"), "// replaced versionName \"1.0.0\"").unwrap();

        let files = merge_workspace(&ws, &instance, Path::new("app")).unwrap();
        assert_eq!(files, 2);
        assert!(instance.join("app/src/main/assets/index.html").is_file());
        assert_eq!(
            read(instance.join("app/build.gradle")),
            "// replaced versionName \"1.0.0\""
        );
        // Untouched template files survive the merge.
        assert!(instance.join("app/src/main/AndroidManifest.xml").is_file());

        let _ = fs::remove_dir_all(&tmp);
    }
}
