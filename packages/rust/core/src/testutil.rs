//! Fixtures shared by the unit tests of this crate.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;
use webapk_shared::{AppConfig, PipelineConfig, ProjectSettings};

pub const MANIFEST: &str = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <application android:label="APP_NAME" android:icon="@mipmap/ic_launcher" />
</manifest>
"#;

pub const BUILD_GRADLE: &str = r#"android {
    defaultConfig {
        applicationId "com.example.app"
        versionName "1.0.0"
    }
}
"#;

pub const DEFAULT_ICON: &[u8] = b"default-icon";

/// Build script that succeeds and leaves an artifact where gradle would.
pub const BUILD_OK: &str = "mkdir -p app/build/outputs/apk/debug && \
     cat app/src/main/AndroidManifest.xml > app/build/outputs/apk/debug/app-debug.apk";

pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("webapk-{label}-test-{}", uuid::Uuid::now_v7()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write a minimal application template under `root`.
pub fn write_template(root: &Path) {
    fs::create_dir_all(root.join("app/src/main/res/mipmap-xxxhdpi")).unwrap();
    fs::write(root.join("app/src/main/AndroidManifest.xml"), MANIFEST).unwrap();
    fs::write(root.join("app/build.gradle"), BUILD_GRADLE).unwrap();
    fs::write(
        root.join("app/src/main/res/mipmap-xxxhdpi/ic_launcher.png"),
        DEFAULT_ICON,
    )
    .unwrap();
    fs::write(root.join("settings.gradle"), "include ':app'\n").unwrap();
}

/// Write a zip archive containing `(name, contents)` entries.
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

pub fn settings() -> ProjectSettings {
    ProjectSettings {
        app_name: "Demo".into(),
        package_name: "com.demo.app".into(),
        version: "2.0.0".into(),
        target_url: Url::parse("https://demo.example.com/").unwrap(),
        icon: None,
    }
}

/// Pipeline config rooted at `root`, running `script` through `sh -c`.
pub fn pipeline_config(root: &Path, script: &str) -> PipelineConfig {
    let template_dir = root.join("template");
    if !template_dir.exists() {
        write_template(&template_dir);
    }

    let mut config = PipelineConfig::from(&AppConfig::default());
    config.template_dir = template_dir;
    config.work_dir = root.join("work");
    config.output_dir = root.join("builds");
    config.program = "sh".into();
    config.args = vec!["-c".into(), script.into()];
    config.timeout = Duration::from_secs(30);
    config.retain_scratch = true;
    config
}
