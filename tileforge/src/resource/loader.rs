//! Catalogue loading.
//!
//! A catalogue file holds a single resource object, an array of resource
//! objects, or an include directive whose value is a glob pattern (or an
//! array of patterns) relative to the including file. Includes expand
//! recursively; already-visited paths are skipped so include cycles
//! terminate.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::coord::{LodRange, TileRange};
use crate::frame::{DualId, Registry};

use super::{
    Definition, FileClass, FileClassSettings, GeneratorId, GeneratorKind, Resource, ResourceId,
};

/// Catalogue loading failure.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unable to load resources from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid resource config file {path}: {message}")]
    Format { path: PathBuf, message: String },

    #[error("duplicate entry for <{0}>")]
    Duplicate(ResourceId),
}

impl LoadError {
    fn format(path: &Path, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Loads a whole catalogue rooted at `path`.
///
/// Returns resources keyed by id; one input entry fans out to one
/// resource per configured reference frame.
pub fn load_catalogue(
    path: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
) -> Result<BTreeMap<ResourceId, Resource>, LoadError> {
    let mut resources = BTreeMap::new();
    let mut visited = HashSet::new();
    load_file(path, system, defaults, &mut resources, &mut visited)?;
    Ok(resources)
}

fn load_file(
    path: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
    resources: &mut BTreeMap<ResourceId, Resource>,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), LoadError> {
    let canonical = path
        .canonicalize()
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if !visited.insert(canonical.clone()) {
        warn!(path = %path.display(), "Skipping already-included catalogue file");
        return Ok(());
    }

    let text = std::fs::read_to_string(&canonical).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| LoadError::format(path, e.to_string()))?;

    parse_value(&value, &canonical, system, defaults, resources, visited)
}

fn parse_value(
    value: &Value,
    path: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
    resources: &mut BTreeMap<ResourceId, Resource>,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), LoadError> {
    match value {
        Value::Array(items) => {
            for item in items {
                parse_entry(item, path, system, defaults, resources, visited)?;
            }
            Ok(())
        }
        Value::Object(_) => parse_entry(value, path, system, defaults, resources, visited),
        _ => Err(LoadError::format(
            path,
            "top-level configuration is not an array nor an object",
        )),
    }
}

fn parse_entry(
    value: &Value,
    path: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
    resources: &mut BTreeMap<ResourceId, Resource>,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), LoadError> {
    let object = value
        .as_object()
        .ok_or_else(|| LoadError::format(path, "resource definition is not an object"))?;

    if let Some(include) = object.get("include") {
        let patterns: Vec<&str> = match include {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        LoadError::format(path, "include declaration must be a string")
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(LoadError::format(
                    path,
                    "include declaration must be a string or an array of strings",
                ))
            }
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        for pattern in patterns {
            expand_include(pattern, dir, path, system, defaults, resources, visited)?;
        }
        return Ok(());
    }

    for resource in parse_resource(value, path, system, defaults)? {
        let id = resource.id.clone();
        if resources.insert(id.clone(), resource).is_some() {
            return Err(LoadError::Duplicate(id));
        }
    }
    Ok(())
}

fn expand_include(
    pattern: &str,
    dir: &Path,
    from: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
    resources: &mut BTreeMap<ResourceId, Resource>,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), LoadError> {
    let absolute = dir.join(pattern);
    let spec = absolute.to_string_lossy().into_owned();
    let paths = glob::glob(&spec)
        .map_err(|e| LoadError::format(from, format!("bad include pattern <{pattern}>: {e}")))?;

    for entry in paths {
        let include_path = entry
            .map_err(|e| LoadError::format(from, format!("include expansion failed: {e}")))?;
        if include_path.is_dir() {
            continue;
        }
        info!(
            path = %include_path.display(),
            from = %from.display(),
            "Loading resources from included file"
        );
        load_file(&include_path, system, defaults, resources, visited)?;
    }
    Ok(())
}

/// Parses a single resource object, fanning out per reference frame.
fn parse_resource(
    value: &Value,
    path: &Path,
    system: &Arc<Registry>,
    defaults: &FileClassSettings,
) -> Result<Vec<Resource>, LoadError> {
    let get_str = |name: &str| -> Result<String, LoadError> {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LoadError::format(path, format!("missing mandatory field <{name}>")))
    };

    let group = get_str("group")?;
    let id = get_str("id")?;
    let kind: GeneratorKind = get_str("type")?
        .parse()
        .map_err(|e: String| LoadError::format(path, e))?;
    let driver = get_str("driver")?;
    let generator = GeneratorId::new(kind, driver);

    let comment = value
        .get("comment")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let revision = value
        .get("revision")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let registry: Registry = match value.get("registry") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| LoadError::format(path, format!("invalid registry: {e}")))?,
        None => Registry::default(),
    };

    let file_classes = parse_file_classes(value.get("maxAge"), defaults, path)?;

    let definition_value = value
        .get("definition")
        .ok_or_else(|| LoadError::format(path, "missing mandatory field <definition>"))?;
    let definition = Definition::parse(&generator, definition_value)
        .map_err(|e| LoadError::format(path, e))?;

    let frames = value
        .get("referenceFrames")
        .ok_or_else(|| LoadError::format(path, "missing mandatory field <referenceFrames>"))?;

    let has_ranges = frames.is_object();
    if !has_ranges && !frames.is_array() {
        return Err(LoadError::format(
            path,
            format!("<{group}-{id}>: referenceFrames is not an object nor an array"),
        ));
    }
    if definition.needs_ranges() && !has_ranges {
        return Err(LoadError::format(
            path,
            format!("<{group}-{id}>: missing mandatory lod/tile ranges"),
        ));
    }
    if !definition.needs_ranges() && has_ranges {
        warn!(
            resource = %format!("{group}-{id}"),
            "Resource does not need lod/tile ranges; ignored"
        );
    }

    let view = crate::frame::RegistryView::new(registry.clone(), Arc::clone(system));
    let credits = parse_credits(value.get("credits"), &view, path)?;

    let template = Resource {
        id: ResourceId::new(String::new(), group, id),
        generator,
        comment,
        revision,
        credits,
        registry,
        lod_range: LodRange::empty(),
        tile_range: TileRange::new((0, 0), (0, 0)),
        file_classes,
        definition,
    };

    let mut out = Vec::new();
    if has_ranges && template.definition.needs_ranges() {
        let map = frames.as_object().expect("checked above");
        for (frame_name, content) in map {
            let mut resource = template.clone();
            resource.id.reference_frame = frame_name.clone();
            require_frame(&view, frame_name, path, &resource.id)?;

            resource.lod_range = parse_lod_range(content.get("lodRange"), path, &resource.id)?;
            resource.tile_range = parse_tile_range(content.get("tileRange"), path, &resource.id)?;
            if resource.lod_range.is_empty() {
                return Err(LoadError::format(
                    path,
                    format!("<{}>: invalid lod range", resource.id),
                ));
            }
            out.push(resource);
        }
    } else {
        let names: Vec<String> = match frames {
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        LoadError::format(path, "referenceFrame entry is not a string")
                    })
                })
                .collect::<Result<_, _>>()?,
            Value::Object(map) => map.keys().cloned().collect(),
            _ => unreachable!("checked above"),
        };
        for frame_name in names {
            let mut resource = template.clone();
            resource.id.reference_frame = frame_name.clone();
            require_frame(&view, &frame_name, path, &resource.id)?;
            resource.lod_range = LodRange::empty();
            out.push(resource);
        }
    }

    Ok(out)
}

fn require_frame(
    view: &crate::frame::RegistryView,
    name: &str,
    path: &Path,
    id: &ResourceId,
) -> Result<(), LoadError> {
    if view.frame(name).is_none() {
        return Err(LoadError::format(
            path,
            format!("<{id}>: unknown reference frame <{name}>"),
        ));
    }
    Ok(())
}

fn parse_file_classes(
    value: Option<&Value>,
    defaults: &FileClassSettings,
    path: &Path,
) -> Result<FileClassSettings, LoadError> {
    let mut settings = defaults.clone();
    let Some(value) = value else {
        return Ok(settings);
    };
    let map = value
        .as_object()
        .ok_or_else(|| LoadError::format(path, "maxAge is not an object"))?;
    for (name, max_age) in map {
        let class: FileClass = name
            .parse()
            .map_err(|e: String| LoadError::format(path, e))?;
        let age = max_age
            .as_i64()
            .ok_or_else(|| LoadError::format(path, format!("maxAge.{name} is not a number")))?;
        settings.set_max_age(class, age);
    }
    Ok(settings)
}

fn parse_credits(
    value: Option<&Value>,
    view: &crate::frame::RegistryView,
    path: &Path,
) -> Result<BTreeSet<DualId>, LoadError> {
    let Some(value) = value else {
        return Ok(BTreeSet::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| LoadError::format(path, "credits is not an array"))?;

    let mut credits = BTreeSet::new();
    for item in items {
        let credit = match item {
            Value::Number(n) => {
                let numeric = n
                    .as_u64()
                    .ok_or_else(|| LoadError::format(path, "numeric credit is not an integer"))?;
                view.credit_by_number(numeric as u16).ok_or_else(|| {
                    LoadError::format(path, format!("unresolvable credit <{numeric}>"))
                })?
            }
            Value::String(s) => view
                .credit(s)
                .ok_or_else(|| LoadError::format(path, format!("unresolvable credit <{s}>")))?,
            _ => {
                return Err(LoadError::format(
                    path,
                    "credit entry is not a string nor a number",
                ))
            }
        };
        credits.insert(DualId::new(credit.id, credit.numeric_id));
    }
    Ok(credits)
}

fn parse_lod_range(
    value: Option<&Value>,
    path: &Path,
    id: &ResourceId,
) -> Result<LodRange, LoadError> {
    let arr = value
        .and_then(Value::as_array)
        .filter(|a| a.len() == 2)
        .ok_or_else(|| LoadError::format(path, format!("<{id}>: lodRange is not [min, max]")))?;
    let min = arr[0]
        .as_u64()
        .ok_or_else(|| LoadError::format(path, format!("<{id}>: lodRange.min is not a number")))?;
    let max = arr[1]
        .as_u64()
        .ok_or_else(|| LoadError::format(path, format!("<{id}>: lodRange.max is not a number")))?;
    Ok(LodRange::new(min as u8, max as u8))
}

fn parse_tile_range(
    value: Option<&Value>,
    path: &Path,
    id: &ResourceId,
) -> Result<TileRange, LoadError> {
    let arr = value
        .and_then(Value::as_array)
        .filter(|a| a.len() == 2)
        .ok_or_else(|| {
            LoadError::format(path, format!("<{id}>: tileRange is not [[x,y],[x,y]]"))
        })?;
    let corner = |v: &Value| -> Result<(u32, u32), LoadError> {
        let pair = v.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
            LoadError::format(path, format!("<{id}>: tileRange corner is not [x, y]"))
        })?;
        let x = pair[0].as_u64().ok_or_else(|| {
            LoadError::format(path, format!("<{id}>: tileRange x is not a number"))
        })?;
        let y = pair[1].as_u64().ok_or_else(|| {
            LoadError::format(path, format!("<{id}>: tileRange y is not a number"))
        })?;
        Ok((x as u32, y as u32))
    };
    Ok(TileRange::new(corner(&arr[0])?, corner(&arr[1])?))
}

/// Serialises a resource back into its catalogue form.
///
/// `load ∘ save` is the identity on the definition payload.
pub fn save_resource(resource: &Resource) -> Value {
    let mut value = serde_json::Map::new();
    value.insert("group".into(), resource.id.group.clone().into());
    value.insert("id".into(), resource.id.id.clone().into());
    value.insert("type".into(), resource.generator.kind.to_string().into());
    value.insert("driver".into(), resource.generator.driver.clone().into());
    value.insert("comment".into(), resource.comment.clone().into());
    value.insert("revision".into(), resource.revision.into());
    value.insert(
        "registry".into(),
        serde_json::to_value(&resource.registry).expect("registry serialises"),
    );
    value.insert(
        "credits".into(),
        resource
            .credits
            .iter()
            .map(|c| Value::from(c.id.clone()))
            .collect::<Vec<_>>()
            .into(),
    );

    if resource.definition.needs_ranges() {
        let mut content = serde_json::Map::new();
        content.insert(
            "lodRange".into(),
            serde_json::json!([resource.lod_range.min, resource.lod_range.max]),
        );
        content.insert(
            "tileRange".into(),
            serde_json::json!([
                [resource.tile_range.ll.0, resource.tile_range.ll.1],
                [resource.tile_range.ur.0, resource.tile_range.ur.1]
            ]),
        );
        let mut frames = serde_json::Map::new();
        frames.insert(resource.id.reference_frame.clone(), content.into());
        value.insert("referenceFrames".into(), frames.into());
    } else {
        value.insert(
            "referenceFrames".into(),
            serde_json::json!([resource.id.reference_frame]),
        );
    }

    value.insert("definition".into(), resource.definition.to_json());
    value.into()
}
