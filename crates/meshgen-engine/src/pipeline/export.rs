//! Re-export of a finished run's mesh in another format.

use std::fs;
use std::path::{Path, PathBuf};

use meshgen_types::{GenerationStats, PipelineError};
use serde::{Deserialize, Serialize};

use super::run::{PipelineRun, StagePayload};
use super::{
    PipelineOrchestrator, STAGE_FACE_REDUCTION, STAGE_MESH_CLEANUP, TEXTURED_MESH_GLB, TEXTURED_MESH_OBJ,
    WHITE_MESH_GLB,
};
use crate::mesh_io::{self, glb, MeshFormat, WriteOptions};
use crate::output_cache::OutputFolder;
use crate::stages::builtin::sibling;
use crate::viewer;

pub const STAGE_EXPORT: &str = "export";

pub const MIN_TARGET_FACES: usize = 100;
pub const MAX_TARGET_FACES: usize = 1_000_000;
pub const DEFAULT_TARGET_FACES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub file_type: MeshFormat,
    pub reduce_face: bool,
    pub export_texture: bool,
    pub target_face_num: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            file_type: MeshFormat::Glb,
            reduce_face: false,
            export_texture: false,
            target_face_num: DEFAULT_TARGET_FACES,
        }
    }
}

impl ExportOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.export_texture && !self.file_type.supports_texture() {
            return Err(PipelineError::InvalidRequest(format!(
                "{} files cannot carry textures, use glb or obj",
                self.file_type
            )));
        }
        if self.reduce_face && !(MIN_TARGET_FACES..=MAX_TARGET_FACES).contains(&self.target_face_num) {
            return Err(PipelineError::InvalidRequest(format!(
                "target_face_num must be between {MIN_TARGET_FACES} and {MAX_TARGET_FACES}, got {}",
                self.target_face_num
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub folder: OutputFolder,
    /// The exported file.
    pub path: PathBuf,
    /// Preview page for the exported mesh, in the same folder.
    pub viewer_path: PathBuf,
}

impl ExportOutput {
    pub fn folder_id(&self) -> &str {
        self.folder.id()
    }
}

fn copy_into(source: &Path, folder: &OutputFolder) -> Result<PathBuf, PipelineError> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = folder.join(&name);
    fs::copy(source, &target)
        .map_err(|e| PipelineError::stage_failed(STAGE_EXPORT, format!("could not copy {name}: {e}")))?;
    Ok(target)
}

fn require(path: &Path, what: &str) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!("the source folder has no {what}")))
    }
}

impl PipelineOrchestrator {
    /// Export the mesh from a previous run into a fresh output folder.
    pub fn export(&self, source_id: &str, options: &ExportOptions) -> Result<ExportOutput, PipelineError> {
        options.validate()?;
        let source = self
            .cache
            .folder(source_id)
            .ok_or_else(|| PipelineError::InvalidRequest(format!("unknown output folder '{source_id}'")))?;

        log::info!(
            target: "pipeline",
            "Exporting {} as {} (texture: {}, reduce to: {})",
            source.id(),
            options.file_type,
            options.export_texture,
            if options.reduce_face { options.target_face_num.to_string() } else { "off".into() }
        );

        if options.export_texture {
            self.export_textured(&source, options.file_type)
        } else {
            self.export_white(&source, options)
        }
    }

    fn export_textured(&self, source: &OutputFolder, format: MeshFormat) -> Result<ExportOutput, PipelineError> {
        let source_glb = source.join(TEXTURED_MESH_GLB);
        require(&source_glb, "textured mesh, run a textured generation first")?;

        let files: Vec<PathBuf> = match format {
            MeshFormat::Glb => vec![source_glb.clone()],
            MeshFormat::Obj => {
                let obj = source.join(TEXTURED_MESH_OBJ);
                let files = vec![
                    obj.clone(),
                    sibling(&obj, "", "mtl"),
                    sibling(&obj, "", "jpg"),
                    sibling(&obj, "_metallic", "jpg"),
                    sibling(&obj, "_roughness", "jpg"),
                    source_glb.clone(),
                ];
                for file in &files {
                    require(file, "complete textured OBJ asset")?;
                }
                files
            }
            MeshFormat::Ply | MeshFormat::Stl => {
                return Err(PipelineError::InvalidRequest(format!("{format} files cannot carry textures")));
            }
        };

        let folder = self.cache.allocate()?;
        let written = files
            .iter()
            .map(|file| copy_into(file, &folder))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|copied| Ok((copied, self.write_preview(&folder, true)?)));
        let (mut copied, viewer_path) = self.discard_on_error(&folder, written)?;
        let path = copied.remove(0);
        Ok(ExportOutput {
            folder,
            path,
            viewer_path,
        })
    }

    fn export_white(&self, source: &OutputFolder, options: &ExportOptions) -> Result<ExportOutput, PipelineError> {
        let source_glb = source.join(WHITE_MESH_GLB);
        require(&source_glb, "white mesh")?;
        let mesh = glb::read_mesh(&source_glb)
            .map_err(|e| PipelineError::stage_failed(STAGE_EXPORT, format!("could not read {WHITE_MESH_GLB}: {e}")))?;

        let stages = self.acquire_stages(None)?;
        let mut run = PipelineRun::new(stages, 0, GenerationStats::default(), self.options.stage_timeout);
        let describe = |mesh: &meshgen_types::Mesh| StagePayload::Mesh {
            faces: mesh.face_count(),
            vertices: mesh.vertex_count(),
        };

        let reduced = run
            .call(STAGE_MESH_CLEANUP, move |set| set.mesh_cleanup.clean(mesh), describe)
            .and_then(|mesh| {
                if !options.reduce_face {
                    return Ok(mesh);
                }
                let target = options.target_face_num;
                run.call(
                    STAGE_FACE_REDUCTION,
                    move |set| set.face_reduction.reduce(mesh, Some(target)),
                    describe,
                )
            });
        let mesh = match reduced {
            Ok(mesh) => mesh,
            Err(e) => {
                // Nothing to hand the caller yet, so the stage is waited out here.
                if let Some(stage) = run.abandoned.take() {
                    stage.wait();
                }
                return Err(e);
            }
        };

        let folder = self.cache.allocate()?;
        let format = options.file_type;
        let path = folder.join(&format!("white_mesh.{}", format.extension()));
        let write = |format: MeshFormat, path: &Path| {
            mesh_io::write_mesh(&mesh, format, path, &WriteOptions::default())
                .map_err(|e| PipelineError::stage_failed(STAGE_EXPORT, format!("could not write {format} file: {e}")))
        };
        let written = write(format, &path)
            .and_then(|()| match format {
                MeshFormat::Glb => Ok(()),
                _ => write(MeshFormat::Glb, &folder.join(WHITE_MESH_GLB)),
            })
            .and_then(|()| self.write_preview(&folder, false));
        let viewer_path = self.discard_on_error(&folder, written)?;

        log::info!(
            target: "pipeline",
            "Exported {} faces to {}",
            mesh.face_count(),
            path.display()
        );
        Ok(ExportOutput {
            folder,
            path,
            viewer_path,
        })
    }

    fn discard_on_error<T>(&self, folder: &OutputFolder, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if result.is_err() {
            self.cache.discard(folder);
        }
        result
    }

    fn write_preview(&self, folder: &OutputFolder, textured: bool) -> Result<PathBuf, PipelineError> {
        viewer::write_viewer(folder.path(), self.options.viewer, textured)
            .map_err(|e| PipelineError::stage_failed(STAGE_EXPORT, format!("could not write preview page: {e}")))
    }
}
