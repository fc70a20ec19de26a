//! End-to-end catalogue flow: include-glob loading, reconciliation,
//! control-plane queries and the revision/freeze policies, wired the
//! way the daemon wires them (minus the warper processes, which these
//! scenarios never reach).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tileforge::control::Ctrl;
use tileforge::frame::Registry;
use tileforge::generator::{GeneratorContext, Generators, GeneratorsConfig};
use tileforge::resource::{
    load_catalogue, save_resource, FileClassSettings, GeneratorKind, ResourceId,
};
use tileforge::warper::{Warper, WarperConfig};

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

fn raster_json(group: &str, id: &str, dataset: &str) -> String {
    format!(
        r#"{{
            "group": "{group}",
            "id": "{id}",
            "type": "tms",
            "driver": "tms-gdaldem",
            "referenceFrames": {{
                "webmercator": {{
                    "lodRange": [4, 12],
                    "tileRange": [[0, 0], [15, 15]]
                }}
            }},
            "definition": {{
                "dataset": "{dataset}",
                "processing": "hillshade"
            }}
        }}"#
    )
}

async fn harness(
    store: &Path,
    freeze: HashSet<GeneratorKind>,
) -> (Arc<Generators>, Ctrl) {
    // the farm is backed by a placeholder binary; these flows never warp
    let warper = Warper::start(WarperConfig {
        process_count: 1,
        worker_program: Some(PathBuf::from("/bin/cat")),
        ..WarperConfig::default()
    })
    .await
    .unwrap();

    let context = Arc::new(GeneratorContext {
        warper,
        system_registry: Registry::system(),
        store_root: store.to_path_buf(),
        external_url: "http://tiles.example.com".to_string(),
    });
    let generators = Arc::new(Generators::new(
        context,
        GeneratorsConfig {
            freeze,
            purge_removed: false,
        },
    ));
    let ctrl = Ctrl::new(Arc::clone(&generators), Registry::system());
    (generators, ctrl)
}

#[tokio::test]
async fn include_glob_catalogue_loads_both_resources() {
    let dir = tempfile::TempDir::new().unwrap();
    write(dir.path(), "defs/a.json", &raster_json("g", "a", "/data/a.vrt"));
    write(dir.path(), "defs/b.json", &raster_json("g", "b", "/data/b.vrt"));
    let root = write(dir.path(), "resources.json", r#"{"include": "defs/*.json"}"#);

    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();

    let (generators, ctrl) = harness(dir.path(), HashSet::new()).await;
    generators.reconcile(wanted).await;

    assert_eq!(ctrl.handle("has-resource webmercator g a"), "true\n");
    assert_eq!(ctrl.handle("has-resource webmercator g b"), "true\n");
    assert_eq!(ctrl.handle("has-resource webmercator g c"), "false\n");
}

#[tokio::test]
async fn definition_change_bumps_revision_and_url() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = write(
        dir.path(),
        "resources.json",
        &raster_json("g", "dem", "/data/dem.vrt"),
    );
    let (generators, _ctrl) = harness(dir.path(), HashSet::new()).await;

    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    generators.reconcile(wanted).await;

    let id = ResourceId::new("webmercator", "g", "dem");
    assert_eq!(generators.get(&id).unwrap().resource().revision, 0);

    // hillshade -> slope invalidates cached output but stays compatible
    let changed = raster_json("g", "dem", "/data/dem.vrt").replace("hillshade", "slope");
    let root = write(dir.path(), "resources.json", &changed);
    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    generators.reconcile(wanted).await;

    let generator = generators.get(&id).unwrap();
    assert_eq!(generator.resource().revision, 1);

    // tile urls carry both revision tags
    let url = tileforge::fileinfo::tile_url_template(
        "jpg",
        generator.generator_revision(),
        generator.resource().revision,
    );
    assert!(url.ends_with("?gr=0&r=1"));
}

#[tokio::test]
async fn incompatible_change_under_freeze_still_completes_the_reload() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = write(
        dir.path(),
        "resources.json",
        &raster_json("g", "dem", "/data/dem.vrt"),
    );

    let mut freeze = HashSet::new();
    freeze.insert(GeneratorKind::Tms);
    let (generators, ctrl) = harness(dir.path(), freeze).await;

    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    generators.reconcile(wanted).await;
    let id = ResourceId::new("webmercator", "g", "dem");
    assert!(generators.has(&id));

    let token_line = ctrl.handle("update-resources");
    let token: u64 = token_line.lines().nth(1).unwrap().parse().unwrap();

    // an incompatible change: the source dataset is swapped out
    let changed = raster_json("g", "dem", "/data/other.vrt");
    let root = write(dir.path(), "resources.json", &changed);
    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    generators.reconcile(wanted).await;

    // whatever the per-resource verdict, the poll token must report the
    // reload as complete and the resource must stay listed
    assert_eq!(ctrl.handle(&format!("updated-since {token}")), "true\n");
    assert_eq!(ctrl.handle("has-resource webmercator g dem"), "true\n");
}

#[tokio::test]
async fn save_load_identity_on_definition() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = write(
        dir.path(),
        "resources.json",
        &raster_json("g", "dem", "/data/dem.vrt"),
    );
    let loaded =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    let original = loaded.values().next().unwrap();

    let saved = save_resource(original).to_string();
    let resaved = write(dir.path(), "resaved.json", &saved);
    let reloaded =
        load_catalogue(&resaved, &Registry::system(), &FileClassSettings::default()).unwrap();
    let round_tripped = reloaded.values().next().unwrap();

    assert_eq!(round_tripped.definition, original.definition);
    assert_eq!(round_tripped.id, original.id);
    assert_eq!(round_tripped.revision, original.revision);
}

#[tokio::test]
async fn resource_url_composes_store_layout() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = write(
        dir.path(),
        "resources.json",
        &raster_json("g", "dem", "/data/dem.vrt"),
    );
    let (generators, ctrl) = harness(dir.path(), HashSet::new()).await;
    let wanted =
        load_catalogue(&root, &Registry::system(), &FileClassSettings::default()).unwrap();
    generators.reconcile(wanted).await;

    assert_eq!(
        ctrl.handle("resource-url webmercator g dem"),
        "http://tiles.example.com/webmercator/tms/g/dem\n"
    );
    assert_eq!(ctrl.handle("supports-reference-frame webmercator"), "true\n");
    assert_eq!(ctrl.handle("supports-reference-frame mars"), "false\n");
}
