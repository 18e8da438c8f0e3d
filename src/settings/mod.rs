//! Temporary overrides in the project's settings assets.
//!
//! `ProjectSettings.asset` (scripting backend, resolution dialog) and
//! `EditorBuildSettings.asset` (scene list) are patched at the text level
//! before the host starts. The original text is kept and written back
//! once the run is over.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScriptingBackend {
    Mono,
    Il2cpp,
}

impl ScriptingBackend {
    fn value(self) -> u8 {
        match self {
            ScriptingBackend::Mono => 0,
            ScriptingBackend::Il2cpp => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolutionDialog {
    Disabled,
    Enabled,
}

impl ResolutionDialog {
    fn value(self) -> u8 {
        match self {
            ResolutionDialog::Disabled => 0,
            ResolutionDialog::Enabled => 1,
        }
    }
}

/// Requested overrides. Unset fields leave the asset untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub scripting_backend: Option<ScriptingBackend>,
    pub resolution_dialog: Option<ResolutionDialog>,
    /// Scene path relative to the project root.
    pub scene: Option<String>,
}

impl SettingsOverrides {
    pub fn is_empty(&self) -> bool {
        self.scripting_backend.is_none() && self.resolution_dialog.is_none() && self.scene.is_none()
    }
}

/// Applied overrides, holding the original file contents.
#[derive(Debug)]
pub struct AppliedSettings {
    project_settings: PathBuf,
    build_settings: PathBuf,
    original_project: String,
    original_build: String,
}

impl AppliedSettings {
    /// Write the original contents back.
    pub fn restore(self) -> Result<()> {
        info!("Restoring settings in ProjectSettings.asset and EditorBuildSettings.asset to how they were");
        fs::write(&self.project_settings, &self.original_project)
            .with_context(|| format!("failed to restore {}", self.project_settings.display()))?;
        fs::write(&self.build_settings, &self.original_build)
            .with_context(|| format!("failed to restore {}", self.build_settings.display()))?;
        Ok(())
    }
}

/// Patch the project's settings assets. Returns `None` when there is
/// nothing to override.
pub fn apply(project: &Path, overrides: &SettingsOverrides) -> Result<Option<AppliedSettings>> {
    if overrides.is_empty() {
        return Ok(None);
    }

    let settings_dir = project.join("ProjectSettings");
    let project_settings = settings_dir.join("ProjectSettings.asset");
    let build_settings = settings_dir.join("EditorBuildSettings.asset");

    let original_project = fs::read_to_string(&project_settings)
        .with_context(|| format!("could not find {}", project_settings.display()))?;
    let original_build = fs::read_to_string(&build_settings)
        .with_context(|| format!("could not find {}", build_settings.display()))?;

    let mut patched_project = original_project.clone();
    if let Some(backend) = overrides.scripting_backend {
        info!("Setting scriptingBackend in ProjectSettings.asset to {backend:?}");
        patched_project = patch_scripting_backend(&patched_project, backend);
    }
    if let Some(dialog) = overrides.resolution_dialog {
        info!("Setting displayResolutionDialog in ProjectSettings.asset to {dialog:?}");
        patched_project = patch_resolution_dialog(&patched_project, dialog);
    }

    let mut patched_build = original_build.clone();
    if let Some(scene) = &overrides.scene {
        let scene_file = project.join(scene);
        if !scene_file.is_file() {
            bail!("failed to find {}", scene_file.display());
        }
        let meta_path = project.join(format!("{scene}.meta"));
        let meta = fs::read_to_string(&meta_path)
            .with_context(|| format!("failed to read {}", meta_path.display()))?;
        let Some(guid) = scene_guid(&meta) else {
            bail!("no guid found in {}", meta_path.display());
        };
        info!("Setting m_Scenes in EditorBuildSettings.asset to {scene}");
        patched_build = patch_scenes(&patched_build, scene, &guid);
    }

    write_all(
        &[
            (
                project_settings.as_path(),
                original_project.as_str(),
                patched_project.as_str(),
            ),
            (
                build_settings.as_path(),
                original_build.as_str(),
                patched_build.as_str(),
            ),
        ],
        &mut |path, text| fs::write(path, text),
    )?;

    Ok(Some(AppliedSettings {
        project_settings,
        build_settings,
        original_project,
        original_build,
    }))
}

/// `(path, original, patched)` for one asset.
type AssetWrite<'a> = (&'a Path, &'a str, &'a str);

/// Write every patched asset. If one write fails, the assets already
/// written get their original text back.
fn write_all(
    assets: &[AssetWrite<'_>],
    write: &mut dyn FnMut(&Path, &str) -> io::Result<()>,
) -> Result<()> {
    for (i, &(path, _, patched)) in assets.iter().enumerate() {
        if let Err(e) = write(path, patched) {
            for &(done, original, _) in &assets[..i] {
                if let Err(undo) = write(done, original) {
                    error!("failed to restore {}: {undo}", done.display());
                }
            }
            return Err(e).with_context(|| format!("failed to write {}", path.display()));
        }
    }
    Ok(())
}

/// Set the Standalone entry of the `scriptingBackend` map.
pub fn patch_scripting_backend(text: &str, backend: ScriptingBackend) -> String {
    let mut lines = split_lines(text);
    let entry = format!("    Standalone: {}", backend.value());

    if let Some(start) = lines
        .iter()
        .position(|l| l.trim_start().starts_with("scriptingBackend"))
    {
        if lines[start].trim_end().ends_with('}') {
            lines[start] = "  scriptingBackend:".to_string();
            lines.insert(start + 1, entry);
        } else {
            let section_end = lines[start + 1..]
                .iter()
                .position(|l| !l.starts_with("    "))
                .map_or(lines.len(), |off| start + 1 + off);
            match (start + 1..section_end).find(|&i| lines[i].trim().starts_with("Standalone:")) {
                Some(i) => lines[i] = entry,
                None => lines.insert(start + 1, entry),
            }
        }
    }

    join_lines(&lines, text)
}

/// Set `displayResolutionDialog`.
pub fn patch_resolution_dialog(text: &str, dialog: ResolutionDialog) -> String {
    let mut lines = split_lines(text);
    if let Some(line) = lines
        .iter_mut()
        .find(|l| l.trim_start().starts_with("displayResolutionDialog:"))
    {
        *line = format!("  displayResolutionDialog: {}", dialog.value());
    }
    join_lines(&lines, text)
}

/// Replace the scene list with a single enabled scene.
pub fn patch_scenes(text: &str, scene: &str, guid: &str) -> String {
    let mut lines = split_lines(text);
    let Some(start) = lines
        .iter()
        .position(|l| l.trim_start().starts_with("m_Scenes:"))
    else {
        return text.to_string();
    };

    let indent_len = lines[start].len() - lines[start].trim_start().len();
    let indent = lines[start][..indent_len].to_string();
    lines[start] = format!("{indent}m_Scenes:");

    while let Some(next) = lines.get(start + 1) {
        let trimmed = next.trim_start();
        if trimmed.starts_with("- enabled") || trimmed.starts_with("guid:") || trimmed.starts_with("path:")
        {
            lines.remove(start + 1);
        } else {
            break;
        }
    }

    lines.insert(start + 1, format!("{indent}- enabled: 1"));
    lines.insert(start + 2, format!("{indent}  path: {scene}"));
    lines.insert(start + 3, format!("{indent}  guid: {guid}"));

    join_lines(&lines, text)
}

/// `guid:` value from a `.meta` file.
pub fn scene_guid(meta: &str) -> Option<String> {
    meta.lines()
        .find_map(|l| l.strip_prefix("guid:"))
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

fn join_lines(lines: &[String], original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}
