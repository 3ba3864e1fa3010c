mod common;

use common::*;
use dre::archive::ArchiveReader;
use dre::array::StoredArray;
use dre::cancel::CancellationToken;
use dre::collector::Collector;
use dre::cutout::{CutoutArchive, ObjectId};
use dre::feeder::Feeder;
use dre::kernel::ChiSquareKernel;
use dre::orchestrator::{Engine, FileOutcome, JobState};
use dre::queue::work_queue_pair;
use dre::result::Summary;
use dre::worker::{Worker, WorkerPool};
use dre::DreError;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

type RowKey = (i64, i64, [usize; 4]);

fn row_set(summary_path: &Path) -> BTreeSet<RowKey> {
    Summary::load(summary_path)
        .unwrap()
        .iter()
        .map(|r| (r.parameters.ext_number, r.parameters.number, r.parameters.grid_index().as_array()))
        .collect()
}

#[test]
fn test_four_items_two_workers() {
    let dir = tempdir().unwrap();
    let models = scenario_models();
    assert_eq!(models.models().shape(), &[2, 3, 3, 5, 16, 16]);
    let convolved = convolved(&models);

    let mut cutouts = fittable(&convolved, 3);
    cutouts.push((ObjectId::new(2, 9), unfittable_cutout()));

    let mut config = config(dir.path(), 2);
    config.save_mosaics = true;
    let input = write_tile(&config.paths, "tile", &cutouts, true);
    let job = config.paths.job_paths(&input);
    std::fs::create_dir_all(&config.paths.output_dir).unwrap();

    let engine = Engine::new(config, models.shared(), Arc::new(ChiSquareKernel));
    let report = match engine.fit_file(&job, "(1/1)").unwrap() {
        FileOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(report.state, JobState::Done);
    assert_eq!(report.submitted, 4);
    assert_eq!(report.acknowledged, 4);
    assert_eq!(report.collected, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.crashed_workers, 0);

    let rows = Summary::load(&job.summary).unwrap();
    assert_eq!(rows.len(), report.succeeded);
    let mut row_indices: Vec<usize> = rows.iter().map(|r| r.row).collect();
    row_indices.sort();
    assert_eq!(row_indices, vec![0, 1, 2]);

    for row in &rows {
        let id = ObjectId::new(row.parameters.ext_number, row.parameters.number);
        let expected = cutouts.iter().position(|(c, _)| *c == id).unwrap() + 1;
        assert_eq!(row.parameters.grid_index(), grid_index(expected));
        assert!(job.mosaic_file(id.as_str()).is_file());
        assert_eq!(read_fits_image(&job.mosaic_file(id.as_str())).dim(), (16, 48));
    }

    let mut scores: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(&job.output).unwrap();
    assert_eq!(scores.len(), 3);
    assert!(!scores.contains("02_0009"));
    assert_eq!(scores.get("01_0001").unwrap().unwrap().shape, vec![2, 3, 3, 5]);
    assert!(!job.mosaic_file("02_0009").exists());
}

#[test]
fn test_ids_in_summary_match_object_ids() {
    let dir = tempdir().unwrap();
    let models = scenario_models();
    let convolved = convolved(&models);
    let cutouts: Vec<_> = fittable(&convolved, 6)
        .into_iter()
        .enumerate()
        .map(|(i, (_, c))| (ObjectId::new(3 + i as i64 % 2, 1000 + 7 * i as i64), c))
        .collect();
    let config = config(dir.path(), 3);
    write_tile(&config.paths, "ids", &cutouts, true);

    let engine = Engine::new(config, models.shared(), Arc::new(ChiSquareKernel));
    let report = engine.fit_dir().unwrap();
    assert_eq!(report.completed(), 1);

    let job = engine.config().paths.job_paths(&engine.config().paths.input_dir.join("ids_cuts.bin"));
    let scores: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(&job.output).unwrap();
    for row in Summary::load(&job.summary).unwrap() {
        let key = ObjectId::new(row.parameters.ext_number, row.parameters.number);
        assert!(cutouts.iter().any(|(id, _)| *id == key));
        assert!(scores.contains(key.as_str()));
    }

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&job.summary).unwrap()).unwrap();
    let first = &raw[0];
    assert!(first["EXT_NUMBER"].is_i64());
    assert!(first["NUMBER"].is_i64());
    assert!(first["ROW"].is_u64());
}

#[test]
fn test_same_rows_for_any_worker_count() {
    let models = scenario_models();
    let convolved = convolved(&models);
    let mut cutouts = fittable(&convolved, 12);
    cutouts.push((ObjectId::new(1, 99), unfittable_cutout()));

    let mut sets = Vec::new();
    for n_proc in [1, 2, 4] {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), n_proc);
        let input = write_tile(&config.paths, "tile", &cutouts, true);
        let job = config.paths.job_paths(&input);
        let engine = Engine::new(config, models.clone().shared(), Arc::new(ChiSquareKernel));
        engine.fit_dir().unwrap();
        sets.push(row_set(&job.summary));
    }
    assert_eq!(sets[0].len(), 12);
    assert_eq!(sets[0], sets[1]);
    assert_eq!(sets[0], sets[2]);
}

/// Feed the same archive in a given order through a three-stage pipeline.
fn run_pipeline(dir: &Path, order: Vec<ObjectId>) -> BTreeSet<RowKey> {
    let models = scenario_models();
    let convolved = convolved(&models);
    let config = config(dir, 2);
    let input = config.paths.input_dir.join("tile_cuts.bin");
    let job = config.paths.job_paths(&input);
    let timeout = Duration::from_millis(50);
    let cancel = CancellationToken::new();

    let (in_tx, in_rx) = work_queue_pair("input", Some(3));
    let (out_tx, out_rx) = work_queue_pair("output", None);
    let n = order.len();
    let feeder = {
        let feeder = Feeder::new(input.clone(), order, 2, timeout);
        let cancel = cancel.clone();
        std::thread::spawn(move || feeder.run(in_tx, cancel))
    };
    let worker = Worker::new(convolved, Arc::new(ChiSquareKernel), false, timeout);
    let pool = WorkerPool::spawn(2, worker, in_rx, out_tx, &cancel).unwrap();
    let collector = {
        let collector = Collector::new(job.clone(), n, false, timeout);
        let cancel = cancel.clone();
        std::thread::spawn(move || collector.run(out_rx, cancel))
    };

    assert!(feeder.join().unwrap().unwrap().completed);
    assert_eq!(pool.join().crashed, 0);
    let outcome = collector.join().unwrap();
    assert!(outcome.error.is_none());
    outcome
        .summary
        .rows()
        .iter()
        .map(|r| (r.parameters.ext_number, r.parameters.number, r.parameters.grid_index().as_array()))
        .collect()
}

#[test]
fn test_feed_order_does_not_change_rows() {
    let models = scenario_models();
    let convolved = convolved(&models);
    let mut cutouts = fittable(&convolved, 10);
    cutouts.push((ObjectId::new(1, 50), unfittable_cutout()));

    let mut results = Vec::new();
    for rotation in [0, 3, 7] {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 2);
        let input = write_tile(&config.paths, "tile", &cutouts, true);
        std::fs::create_dir_all(&config.paths.output_dir).unwrap();

        let mut order = CutoutArchive::open(&input).unwrap().object_ids();
        order.rotate_left(rotation);
        if rotation == 7 {
            order.reverse();
        }
        results.push(run_pipeline(dir.path(), order));
    }
    assert_eq!(results[0].len(), 10);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[test]
fn test_rerun_replaces_previous_output() {
    let dir = tempdir().unwrap();
    let models = scenario_models();
    let convolved = convolved(&models);
    let config = config(dir.path(), 2);
    let input = write_tile(&config.paths, "tile", &fittable(&convolved, 4), true);
    let job = config.paths.job_paths(&input);
    let engine = Engine::new(config, models.shared(), Arc::new(ChiSquareKernel));

    engine.fit_dir().unwrap();
    let first = row_set(&job.summary);
    engine.fit_dir().unwrap();
    assert_eq!(row_set(&job.summary), first);
    let scores: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(&job.output).unwrap();
    assert_eq!(scores.len(), 4);
}

#[test]
fn test_missing_model_file_is_fatal() {
    let dir = tempdir().unwrap();
    let err = Engine::load(config(dir.path(), 1), &dir.path().join("models.bin")).err().unwrap();
    assert!(matches!(err, DreError::ModelLoad(_)));

    let garbage = dir.path().join("garbage.bin");
    std::fs::write(&garbage, b"not an archive").unwrap();
    let err = Engine::load(config(dir.path(), 1), &garbage).err().unwrap();
    assert!(matches!(err, DreError::ModelLoad(_)));
}

#[test]
fn test_saved_models_load_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("models.bin");
    scenario_models().save(&path).unwrap();
    let engine = Engine::load(config(dir.path(), 1), &path).unwrap();
    assert_eq!(engine.models().grid_shape(), [2, 3, 3, 5]);
}
