//! Integration tests for the scaffold and curation passes
//!
//! Converter output is written straight into `work/` so the passes run
//! without an external converter.

use bidsmith_engine::config::Config;
use bidsmith_engine::curator::Curator;
use bidsmith_engine::dataset::{DatasetLayout, DatasetState};
use bidsmith_engine::registry::Registry;
use bidsmith_engine::translator::Translator;
use sdk::errors::CurateError;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn dataset() -> (TempDir, DatasetLayout) {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("sourcedata")).unwrap();
    let layout = DatasetLayout::open(temp.path()).unwrap();
    (temp, layout)
}

/// Write one converted series; the image bytes are its stem.
fn write_series(layout: &DatasetLayout, session_dir: &str, stem: &str, meta: Value) {
    let dir = layout.work().join(session_dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.nii.gz", stem)), stem.as_bytes()).unwrap();
    fs::write(dir.join(format!("{}.json", stem)), meta.to_string()).unwrap();
}

fn write_translator(layout: &DatasetLayout, table: Value) {
    fs::create_dir_all(layout.code()).unwrap();
    fs::write(
        layout.translator_path(),
        serde_json::to_string_pretty(&table).unwrap(),
    )
    .unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn rest_session(layout: &DatasetLayout) {
    write_series(
        layout,
        "sub-S1/ses-1",
        "S1--T1_MPRAGE--GR--2",
        json!({
            "SeriesDescription": "T1_MPRAGE",
            "AcquisitionTime": "10:00:00.000000",
            "AcquisitionDate": "2024-03-01",
            "PatientAge": "035Y",
            "PatientSex": "F"
        }),
    );
    write_series(
        layout,
        "sub-S1/ses-1",
        "S1--rest_bold--EP--5",
        json!({"SeriesDescription": "rest_bold", "AcquisitionTime": "10:20:00.000000"}),
    );
    write_series(
        layout,
        "sub-S1/ses-1",
        "S1--rest_bold--EP--3",
        json!({"SeriesDescription": "rest_bold", "AcquisitionTime": "10:10:00.000000"}),
    );
}

fn rest_translator() -> Value {
    json!({
        "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
        "rest_bold": ["func", "task-rest_bold", "UNASSIGNED"]
    })
}

#[test]
fn test_two_runs_numbered_in_acquisition_order() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(&layout, rest_translator());

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());

    let func = layout.root().join("sub-S1/ses-1/func");
    let run1 = func.join("sub-S1_ses-1_task-rest_run-01_bold.nii.gz");
    let run2 = func.join("sub-S1_ses-1_task-rest_run-02_bold.nii.gz");
    assert_eq!(fs::read(&run1).unwrap(), b"S1--rest_bold--EP--3");
    assert_eq!(fs::read(&run2).unwrap(), b"S1--rest_bold--EP--5");

    let sidecar = read_json(&func.join("sub-S1_ses-1_task-rest_run-01_bold.json"));
    assert_eq!(sidecar["TaskName"], "rest");
    assert!(func.join("sub-S1_ses-1_task-rest_run-01_events.tsv").is_file());

    assert!(layout
        .root()
        .join("sub-S1/ses-1/anat/sub-S1_ses-1_run-01_T1w.nii.gz")
        .is_file());

    let participants = fs::read_to_string(layout.participants_tsv()).unwrap();
    assert!(participants.contains("sub-S1\t35\tF\tn/a"));
    let sessions = fs::read_to_string(layout.root().join("sub-S1/sub-S1_sessions.tsv")).unwrap();
    assert!(sessions.contains("ses-1\t2024-03-01T10:00:00.000000"));

    assert_eq!(DatasetState::detect(&layout).unwrap(), DatasetState::Curated);
}

#[test]
fn test_curation_is_idempotent() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(&layout, rest_translator());

    let curator = Curator::new(&layout, &config).unwrap();
    let first = curator.curate(None).unwrap();
    assert!(first.files_placed() > 0);

    let second = curator.curate(None).unwrap();
    assert_eq!(second.files_placed(), 0);
    assert!(second.sessions.iter().all(|s| s.is_up_to_date()));
    assert!(!layout
        .root()
        .join("sub-S1/ses-1/func/sub-S1_ses-1_task-rest_run-03_bold.nii.gz")
        .exists());

    let participants = fs::read_to_string(layout.participants_tsv()).unwrap();
    assert_eq!(participants.matches("sub-S1").count(), 1);
}

#[test]
fn test_new_run_continues_numbering() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(&layout, rest_translator());

    let curator = Curator::new(&layout, &config).unwrap();
    curator.curate(None).unwrap();

    write_series(
        &layout,
        "sub-S1/ses-1",
        "S1--rest_bold--EP--7",
        json!({"SeriesDescription": "rest_bold", "AcquisitionTime": "10:30:00.000000"}),
    );
    curator.curate(None).unwrap();

    let run3 = layout
        .root()
        .join("sub-S1/ses-1/func/sub-S1_ses-1_task-rest_run-03_bold.nii.gz");
    assert_eq!(fs::read(run3).unwrap(), b"S1--rest_bold--EP--7");
}

#[test]
fn test_fieldmap_intended_for_and_echo_times() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_series(
        &layout,
        "sub-S1/ses-1",
        "S1--FMAP--GR--6_e1",
        json!({"SeriesDescription": "FMAP", "AcquisitionTime": "10:05:00.000000", "EchoTime": 0.00492}),
    );
    write_series(
        &layout,
        "sub-S1/ses-1",
        "S1--FMAP--GR--7_e2_ph",
        json!({"SeriesDescription": "FMAP", "AcquisitionTime": "10:05:30.000000", "EchoTime": 0.00738}),
    );
    write_translator(
        &layout,
        json!({
            "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
            "rest_bold": ["func", "task-rest_bold", "UNASSIGNED"],
            "FMAP": ["fmap", "acq-rest", ["task-rest_bold"]]
        }),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());
    assert!(summary.sessions[0].flagged.is_empty());

    let fmap = layout.root().join("sub-S1/ses-1/fmap");
    assert!(fmap.join("sub-S1_ses-1_acq-rest_run-01_magnitude1.nii.gz").is_file());

    let phasediff = read_json(&fmap.join("sub-S1_ses-1_acq-rest_run-01_phasediff.json"));
    assert_eq!(
        phasediff["IntendedFor"],
        json!([
            "ses-1/func/sub-S1_ses-1_task-rest_run-01_bold.nii.gz",
            "ses-1/func/sub-S1_ses-1_task-rest_run-02_bold.nii.gz"
        ])
    );
    assert_eq!(phasediff["EchoTime1"], json!(0.00492));
    assert_eq!(phasediff["EchoTime2"], json!(0.00738));
}

#[test]
fn test_unresolved_target_is_a_warning() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    write_series(
        &layout,
        "sub-S1",
        "S1--FMAP_AP--EP--4",
        json!({"SeriesDescription": "FMAP_AP", "AcquisitionTime": "09:00:00"}),
    );
    write_translator(
        &layout,
        json!({"FMAP_AP": ["fmap", "acq-se", ["task-nback_bold"]]}),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());
    assert!(summary.sessions[0]
        .warnings
        .iter()
        .any(|w| w.contains("task-nback_bold")));

    let sidecar = read_json(
        &layout
            .root()
            .join("sub-S1/fmap/sub-S1_acq-se_dir-AP_run-01_epi.json"),
    );
    assert!(sidecar.get("IntendedFor").is_none());
}

#[test]
fn test_excluded_protocols_produce_nothing() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(
        &layout,
        json!({
            "T1_MPRAGE": ["EXCLUDE_BIDS_Directory", "EXCLUDE_BIDS_Name", "UNASSIGNED"],
            "rest_bold": ["func", "EXCLUDE_bold", "UNASSIGNED"]
        }),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert_eq!(summary.files_placed(), 0);
    assert_eq!(summary.sessions[0].excluded.len(), 3);
    assert!(!layout.subject_dir("S1").exists());
    assert!(Registry::new(&layout).subjects().unwrap().is_empty());
}

#[test]
fn test_scaffold_preserves_edits() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);

    let curator = Curator::new(&layout, &config).unwrap();
    let report = curator.scaffold(false).unwrap();
    assert_eq!(report.merge.added, vec!["T1_MPRAGE", "rest_bold"]);
    assert!(report.translator_written);
    assert!(report.config_written);
    assert!(layout.root().join("dataset_description.json").is_file());

    // User edits one entry
    let mut table = read_json(&layout.translator_path());
    table["T1_MPRAGE"] = json!(["anat", "T1w", "UNASSIGNED"]);
    write_translator(&layout, table);

    write_series(
        &layout,
        "sub-S2/ses-1",
        "S2--DTI_64--EP--9",
        json!({"SeriesDescription": "DTI_64"}),
    );
    let report = curator.scaffold(false).unwrap();
    assert_eq!(report.merge.added, vec!["DTI_64"]);
    assert_eq!(report.merge.existing, 2);

    let translator = Translator::load(&layout.translator_path()).unwrap();
    let t1 = translator.get("T1_MPRAGE").unwrap();
    assert_eq!(t1.directory(), "anat");
    assert!(!t1.is_excluded());
    assert!(translator.get("DTI_64").unwrap().is_placeholder());

    // Nothing new: no rewrite
    let again = curator.scaffold(false).unwrap();
    assert!(!again.translator_written);
    assert!(!again.config_written);
}

#[test]
fn test_scaffold_with_auto_fill() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);

    let report = Curator::new(&layout, &config)
        .unwrap()
        .scaffold(true)
        .unwrap();
    assert!(!report.merge.auto_filled.is_empty());
    assert!(report.coverage.placeholders < report.coverage.total);
}

#[test]
fn test_scaffold_requires_converted_sessions() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    let err = Curator::new(&layout, &config)
        .unwrap()
        .scaffold(false)
        .unwrap_err();
    assert!(matches!(err, CurateError::NotConverted(_)));
    assert!(!layout.translator_path().exists());
}

#[test]
fn test_curate_requires_translator() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    let err = Curator::new(&layout, &config)
        .unwrap()
        .curate(None)
        .unwrap_err();
    assert!(matches!(err, CurateError::TranslatorMissing(_)));
    assert!(!layout.subject_dir("S1").exists());
}

#[test]
fn test_subject_filter() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_series(
        &layout,
        "sub-S2/ses-1",
        "S2--T1_MPRAGE--GR--2",
        json!({"SeriesDescription": "T1_MPRAGE", "AcquisitionTime": "11:00:00"}),
    );
    write_translator(&layout, rest_translator());

    let only = vec!["S2".to_string()];
    let summary = Curator::new(&layout, &config)
        .unwrap()
        .curate(Some(&only))
        .unwrap();
    assert_eq!(summary.sessions.len(), 1);
    assert!(layout.subject_dir("S2").is_dir());
    assert!(!layout.subject_dir("S1").exists());
}

#[test]
fn test_missing_protocol_is_skipped_with_warning() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(
        &layout,
        json!({"T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"]}),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());
    assert!(summary.sessions[0]
        .warnings
        .iter()
        .any(|w| w.contains("rest_bold")));
    assert!(!layout.root().join("sub-S1/ses-1/func").exists());
}

#[test]
fn test_clean_work_dir_after_success() {
    let (_temp, layout) = dataset();
    let mut config = Config::default();
    config.curation.clean_work_dir = true;
    rest_session(&layout);
    write_translator(&layout, rest_translator());

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert_eq!(summary.cleaned.len(), 1);
    assert!(!layout.work().join("sub-S1/ses-1").exists());
    assert!(layout
        .root()
        .join("sub-S1/ses-1/anat/sub-S1_ses-1_run-01_T1w.json")
        .is_file());
}

#[test]
fn test_bad_translator_aborts_before_writing() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(&layout, json!({"T1_MPRAGE": ["anat", "T1w"]}));

    let err = Curator::new(&layout, &config)
        .unwrap()
        .curate(None)
        .unwrap_err();
    assert!(matches!(err, CurateError::TranslatorDecode { .. }));
    assert!(!layout.subject_dir("S1").exists());
}

#[test]
fn test_sessionless_t1_runs_and_fieldmap_link() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    for (stem, time) in [
        ("S1--T1_MPRAGE--GR--2", "10:00:00"),
        ("S1--T1_MPRAGE--GR--4", "10:30:00"),
        ("S1--rest--EP--5", "10:40:00"),
    ] {
        let description = stem.split("--").nth(1).unwrap();
        write_series(
            &layout,
            "sub-S1",
            stem,
            json!({"SeriesDescription": description, "AcquisitionTime": time}),
        );
    }
    write_series(
        &layout,
        "sub-S1",
        "S1--FMAP_GRE--GR--6_e1",
        json!({"SeriesDescription": "FMAP_GRE", "AcquisitionTime": "10:45:00", "EchoTime": 0.00492}),
    );
    write_series(
        &layout,
        "sub-S1",
        "S1--FMAP_GRE--GR--7_e2_ph",
        json!({"SeriesDescription": "FMAP_GRE", "AcquisitionTime": "10:45:30", "EchoTime": 0.00738}),
    );
    write_translator(
        &layout,
        json!({
            "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
            "rest": ["func", "task-rest_bold", "UNASSIGNED"],
            "FMAP_GRE": ["fmap", "acq-rest", ["task-rest_bold"]]
        }),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());

    let anat = layout.root().join("sub-S1/anat");
    for name in [
        "sub-S1_run-01_T1w.nii.gz",
        "sub-S1_run-01_T1w.json",
        "sub-S1_run-02_T1w.nii.gz",
        "sub-S1_run-02_T1w.json",
    ] {
        assert!(anat.join(name).is_file(), "{}", name);
    }

    let phasediff = read_json(
        &layout
            .root()
            .join("sub-S1/fmap/sub-S1_acq-rest_run-01_phasediff.json"),
    );
    assert_eq!(
        phasediff["IntendedFor"],
        json!(["func/sub-S1_task-rest_run-01_bold.nii.gz"])
    );
}

#[test]
fn test_separate_phase_images_are_phase1_and_phase2() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    for (stem, time, echo_time) in [
        ("S1--FMAP--GR--5_e1", "10:05:00.000000", 0.00492),
        ("S1--FMAP--GR--5_e2", "10:05:00.000000", 0.00738),
        ("S1--FMAP--GR--6_e1_ph", "10:05:30.000000", 0.00492),
        ("S1--FMAP--GR--6_e2_ph", "10:05:30.000000", 0.00738),
    ] {
        write_series(
            &layout,
            "sub-S1/ses-1",
            stem,
            json!({"SeriesDescription": "FMAP", "AcquisitionTime": time, "EchoTime": echo_time}),
        );
    }
    write_translator(
        &layout,
        json!({
            "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
            "rest_bold": ["func", "task-rest_bold", "UNASSIGNED"],
            "FMAP": ["fmap", "acq-gre", ["task-rest_bold"]]
        }),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    assert!(summary.is_success());
    assert!(summary.sessions[0].flagged.is_empty());

    let fmap = layout.root().join("sub-S1/ses-1/fmap");
    for contrast in ["magnitude1", "magnitude2", "phase1", "phase2"] {
        let name = format!("sub-S1_ses-1_acq-gre_run-01_{}", contrast);
        assert!(fmap.join(format!("{}.nii.gz", name)).is_file(), "{}", name);
        let sidecar = read_json(&fmap.join(format!("{}.json", name)));
        assert!(sidecar["IntendedFor"].is_array(), "{}", name);
    }
    assert!(!fmap.join("sub-S1_ses-1_acq-gre_run-01_phasediff.nii.gz").exists());
    assert!(!fmap.join("sub-S1_ses-1_acq-gre_run-01_fieldmap.nii.gz").exists());

    let phase1 = read_json(&fmap.join("sub-S1_ses-1_acq-gre_run-01_phase1.json"));
    let phase2 = read_json(&fmap.join("sub-S1_ses-1_acq-gre_run-01_phase2.json"));
    assert_eq!(phase1["EchoTime"], json!(0.00492));
    assert_eq!(phase2["EchoTime"], json!(0.00738));
    assert!(phase2.get("EchoTime1").is_none());
    assert!(phase2.get("EchoTime2").is_none());
    assert_eq!(
        fs::read(fmap.join("sub-S1_ses-1_acq-gre_run-01_phase1.nii.gz")).unwrap(),
        b"S1--FMAP--GR--6_e1_ph"
    );
}

#[test]
fn test_duplicate_fieldmap_is_neutral_unlinked_and_flagged() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    for (stem, time) in [
        ("S1--SE_AP--EP--7", "10:05:00.000000"),
        ("S1--SE_AP--EP--7_a", "10:06:00.000000"),
    ] {
        write_series(
            &layout,
            "sub-S1/ses-1",
            stem,
            json!({
                "SeriesDescription": "SE_AP",
                "AcquisitionTime": time,
                "ScanningSequence": "EP",
                "PhaseEncodingDirection": "j-"
            }),
        );
    }
    write_translator(
        &layout,
        json!({
            "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
            "rest_bold": ["func", "task-rest_bold", "UNASSIGNED"],
            "SE_AP": ["fmap", "acq-se", ["task-rest_bold"]]
        }),
    );

    let summary = Curator::new(&layout, &config).unwrap().curate(None).unwrap();
    let flagged = &summary.sessions[0].flagged;
    assert_eq!(flagged.len(), 1);
    assert!(flagged[0].contains("SE_AP"));

    let fmap = layout.root().join("sub-S1/ses-1/fmap");
    let kept = read_json(&fmap.join("sub-S1_ses-1_acq-se_dir-AP_run-01_epi.json"));
    assert!(kept["IntendedFor"].is_array());
    assert_eq!(
        fs::read(fmap.join("sub-S1_ses-1_acq-se_dir-AP_run-01_epi.nii.gz")).unwrap(),
        b"S1--SE_AP--EP--7"
    );

    let neutral = fmap.join("sub-S1_ses-1_acq-se_run-01_fieldmap");
    assert_eq!(
        fs::read(neutral.with_extension("nii.gz")).unwrap(),
        b"S1--SE_AP--EP--7_a"
    );
    let sidecar = read_json(&neutral.with_extension("json"));
    assert!(sidecar.get("IntendedFor").is_none());
}

#[test]
fn test_adding_a_subject_leaves_curated_subjects_untouched() {
    let (_temp, layout) = dataset();
    let config = Config::default();
    rest_session(&layout);
    write_translator(&layout, rest_translator());

    let curator = Curator::new(&layout, &config).unwrap();
    curator.curate(None).unwrap();

    let snapshot = |root: &Path| -> Vec<(std::path::PathBuf, Vec<u8>)> {
        let mut files: Vec<_> = walkdir::WalkDir::new(root)
            .into_iter()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| (entry.path().to_path_buf(), fs::read(entry.path()).unwrap()))
            .collect();
        files.sort();
        files
    };
    let subject = layout.subject_dir("S1");
    let before = snapshot(&subject);
    assert!(!before.is_empty());
    let participants_before = fs::read_to_string(layout.participants_tsv()).unwrap();

    write_series(
        &layout,
        "sub-S2/ses-1",
        "S2--T1_MPRAGE--GR--2",
        json!({
            "SeriesDescription": "T1_MPRAGE",
            "AcquisitionTime": "11:00:00.000000",
            "PatientAge": "041Y",
            "PatientSex": "M"
        }),
    );
    let only = vec!["S2".to_string()];
    let summary = curator.curate(Some(&only)).unwrap();
    assert!(summary.is_success());
    assert!(layout
        .root()
        .join("sub-S2/ses-1/anat/sub-S2_ses-1_run-01_T1w.nii.gz")
        .is_file());

    assert_eq!(snapshot(&subject), before);
    let participants_after = fs::read_to_string(layout.participants_tsv()).unwrap();
    assert!(participants_after.starts_with(&participants_before));
    assert!(participants_after.contains("sub-S2\t41\tM"));
}
