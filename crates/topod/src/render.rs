//! Template rendering.
//!
//! Templates are Handlebars documents rendered without a data object: every
//! value comes from the registered functions, which read the resource's
//! [`Lookup`] snapshot.
//!
//! | function     | arguments            | result                         |
//! |--------------|----------------------|--------------------------------|
//! | `getv`       | key \[default\]      | value or default / `""`        |
//! | `getvs`      | glob                 | sorted values                  |
//! | `gets`       | glob                 | map of key to value            |
//! | `exists`     | key                  | bool                           |
//! | `ls`         | prefix               | values under prefix            |
//! | `base`/`dir` | path                 | last element / parent          |
//! | `split`      | string, separator    | array                          |
//! | `jsonObject` | string               | decoded object                 |
//! | `jsonArray`  | string               | decoded array                  |

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handlebars::{
    Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, RenderErrorReason,
    ScopedJson,
};
use serde_json::Value as Json;
use tempfile::TempPath;

use crate::cache::Lookup;
use crate::error::ProcessError;
use crate::sync::{apply_mode, apply_owner};

type Function = dyn Fn(&[&Json]) -> Result<Json, String> + Send + Sync;

/// Adapts a plain function over JSON arguments to a Handlebars helper.
struct FunctionHelper {
    name: &'static str,
    func: Box<Function>,
}

impl HelperDef for FunctionHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let args: Vec<&Json> = h.params().iter().map(|p| p.value()).collect();
        (self.func)(&args)
            .map(ScopedJson::Derived)
            .map_err(|reason| RenderErrorReason::Other(format!("{}: {}", self.name, reason)).into())
    }
}

fn register<F>(registry: &mut Handlebars<'static>, name: &'static str, func: F)
where
    F: Fn(&[&Json]) -> Result<Json, String> + Send + Sync + 'static,
{
    registry.register_helper(
        name,
        Box::new(FunctionHelper {
            name,
            func: Box::new(func),
        }),
    );
}

fn str_arg<'a>(args: &[&'a Json], idx: usize) -> Result<&'a str, String> {
    match args.get(idx) {
        Some(Json::String(s)) => Ok(s),
        Some(other) => Err(format!("argument {} must be a string, got {}", idx + 1, other)),
        None => Err(format!("missing argument {}", idx + 1)),
    }
}

fn expect_args(args: &[&Json], min: usize, max: usize) -> Result<(), String> {
    if args.len() < min || args.len() > max {
        return Err(format!(
            "expects {} argument(s), got {}",
            if min == max {
                min.to_string()
            } else {
                format!("{}-{}", min, max)
            },
            args.len()
        ));
    }
    Ok(())
}

fn base(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

fn dir(path: &str) -> String {
    match path.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// A rendered candidate for a destination, removed on drop unless promoted or
/// kept.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn into_temp_path(self) -> TempPath {
        self.path
    }
}

pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        register(
            &mut registry,
            "base",
            |args| {
                expect_args(args, 1, 1)?;
                Ok(Json::from(base(str_arg(args, 0)?)))
            },
        );
        register(
            &mut registry,
            "dir",
            |args| {
                expect_args(args, 1, 1)?;
                Ok(Json::from(dir(str_arg(args, 0)?)))
            },
        );
        register(
            &mut registry,
            "split",
            |args| {
                expect_args(args, 2, 2)?;
                let parts: Vec<&str> = str_arg(args, 0)?.split(str_arg(args, 1)?).collect();
                Ok(Json::from(parts))
            },
        );
        register(
            &mut registry,
            "jsonObject",
            |args| {
                expect_args(args, 1, 1)?;
                match serde_json::from_str::<Json>(str_arg(args, 0)?) {
                    Ok(value @ Json::Object(_)) => Ok(value),
                    Ok(other) => Err(format!("expected a JSON object, got {}", other)),
                    Err(e) => Err(e.to_string()),
                }
            },
        );
        register(
            &mut registry,
            "jsonArray",
            |args| {
                expect_args(args, 1, 1)?;
                match serde_json::from_str::<Json>(str_arg(args, 0)?) {
                    Ok(value @ Json::Array(_)) => Ok(value),
                    Ok(other) => Err(format!("expected a JSON array, got {}", other)),
                    Err(e) => Err(e.to_string()),
                }
            },
        );

        let cache = Arc::clone(&lookup);
        register(
            &mut registry,
            "exists",
            move |args| {
                expect_args(args, 1, 1)?;
                Ok(Json::from(cache.exists(str_arg(args, 0)?)))
            },
        );
        let cache = Arc::clone(&lookup);
        register(
            &mut registry,
            "ls",
            move |args| {
                expect_args(args, 1, 1)?;
                Ok(Json::from(cache.list(str_arg(args, 0)?)))
            },
        );
        let cache = Arc::clone(&lookup);
        register(
            &mut registry,
            "getv",
            move |args| {
                expect_args(args, 1, 2)?;
                let key = str_arg(args, 0)?;
                if args.len() == 2 && !cache.exists(key) {
                    return Ok(Json::from(str_arg(args, 1)?));
                }
                Ok(Json::from(cache.get(key)))
            },
        );
        let cache = Arc::clone(&lookup);
        register(
            &mut registry,
            "getvs",
            move |args| {
                expect_args(args, 1, 1)?;
                Ok(Json::from(cache.get_values(str_arg(args, 0)?)))
            },
        );
        let cache = lookup;
        register(
            &mut registry,
            "gets",
            move |args| {
                expect_args(args, 1, 1)?;
                let map: serde_json::Map<String, Json> = cache
                    .get_all(str_arg(args, 0)?)
                    .into_iter()
                    .map(|(k, v)| (k, Json::from(v)))
                    .collect();
                Ok(Json::Object(map))
            },
        );

        Self { registry }
    }

    /// Renders template text against the function set.
    pub fn render_str(&self, template: &str) -> Result<String, RenderError> {
        self.registry.render_template(template, &())
    }

    /// Renders `src` into a fresh staged file next to `dest`, with `mode` and
    /// the requested ownership applied.
    pub fn render(
        &self,
        src: &Path,
        dest: &Path,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<StagedFile, ProcessError> {
        log::debug!("Loading source template {}", src.display());
        if !src.exists() {
            return Err(ProcessError::MissingTemplate(src.to_path_buf()));
        }
        let template = std::fs::read_to_string(src).map_err(|e| ProcessError::Render {
            path: src.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::debug!("Compiling source template {}", src.display());
        let rendered = self
            .render_str(&template)
            .map_err(|e| ProcessError::Render {
                path: src.to_path_buf(),
                reason: e.to_string(),
            })?;

        let staged = stage(dest, rendered.as_bytes())?;
        apply_mode(staged.path(), mode).map_err(|e| ProcessError::Stage {
            path: staged.path().to_path_buf(),
            source: e,
        })?;
        if let Err(e) = apply_owner(staged.path(), uid, gid) {
            log::warn!(
                "Failed to set owner {:?}:{:?} on {}: {}",
                uid,
                gid,
                staged.path().display(),
                e
            );
        }
        log::debug!("Created staged file {}", staged.path().display());
        Ok(staged)
    }
}

fn stage(dest: &Path, content: &[u8]) -> Result<StagedFile, ProcessError> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        ".{}",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let stage_err = |source: std::io::Error| ProcessError::Stage {
        path: PathBuf::from(dir),
        source,
    };

    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile_in(dir)
        .map_err(stage_err)?;
    file.write_all(content).map_err(stage_err)?;
    file.as_file().sync_all().map_err(stage_err)?;

    Ok(StagedFile {
        path: file.into_temp_path(),
    })
}
