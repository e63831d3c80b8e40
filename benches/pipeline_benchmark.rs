use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use medsurvive::{
    explain, filter, kaplan_meier, metrics, pipeline, CoxModel, Dataset, FilterCriteria, GroupBy, PatientRecord,
    PipelineConfig, SurvivalData,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIAGNOSES: [&str; 4] = ["I10", "E11", "J44", "N18"];
const TREATMENTS: [&str; 3] = ["medical", "surgical", "combined"];

fn generate_synthetic_cohort(n_patients: usize) -> Dataset {
    let mut rng = StdRng::seed_from_u64(42);

    let records = (0..n_patients)
        .map(|i| {
            let age: f64 = rng.gen_range(30.0..80.0);
            let diagnosis = DIAGNOSES[rng.gen_range(0..DIAGNOSES.len())];
            let hazard = (0.03 * (age - 55.0)).exp();
            let time = (-rng.r#gen::<f64>().ln() / (0.1 * hazard)).max(0.1);
            let censoring_time = rng.gen_range(1.0..15.0);

            PatientRecord::new(
                format!("P{i}"),
                age,
                if rng.r#gen::<bool>() { "F" } else { "M" },
                diagnosis,
                TREATMENTS[rng.gen_range(0..TREATMENTS.len())],
                time.min(censoring_time),
                time < censoring_time,
            )
        })
        .collect();

    Dataset::from_records(records)
}

fn generate_synthetic_data(n_samples: usize, n_features: usize) -> SurvivalData {
    let mut rng = StdRng::seed_from_u64(42);

    let covariates = Array2::from_shape_fn((n_samples, n_features), |_| rng.gen_range(-2.0..2.0));
    let true_coefficients = Array1::from_shape_fn(n_features, |j| if j < 3 { 0.5 - 0.3 * j as f64 } else { 0.0 });

    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let hazard = covariates.row(i).dot(&true_coefficients).exp();
        let time = (-rng.r#gen::<f64>().ln() / (0.1 * hazard)).max(0.1);
        let censoring_time = rng.gen_range(1.0..8.0);
        times.push(time.min(censoring_time));
        events.push(time < censoring_time);
    }

    SurvivalData::new(times, events, covariates).unwrap()
}

fn benchmark_cox_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cox_fitting");

    for &n_samples in [50, 100, 200, 500].iter() {
        for &n_features in [5, 10, 20].iter() {
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{}x{}", n_samples, n_features)),
                &(n_samples, n_features),
                |b, &(n_samples, n_features)| {
                    let data = generate_synthetic_data(n_samples, n_features);
                    let model = CoxModel::new().with_penalizer(0.01);
                    b.iter(|| model.fit(black_box(&data)).unwrap());
                },
            );
        }
    }
    group.finish();
}

fn benchmark_penalizer(c: &mut Criterion) {
    let mut group = c.benchmark_group("penalizer");
    let data = generate_synthetic_data(200, 15);

    for &penalizer in [0.0, 0.01, 0.1, 1.0].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(penalizer), &penalizer, |b, &penalizer| {
            let model = CoxModel::new().with_penalizer(penalizer);
            b.iter(|| model.fit(black_box(&data)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_kaplan_meier(c: &mut Criterion) {
    let mut group = c.benchmark_group("kaplan_meier");

    for &n_patients in [100, 1000, 10_000].iter() {
        let dataset = generate_synthetic_cohort(n_patients);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_patients", n_patients)),
            &dataset,
            |b, dataset| {
                b.iter(|| kaplan_meier::estimate(black_box(&dataset.records), GroupBy::DiagnosisCode).unwrap());
            },
        );
    }
    group.finish();
}

fn benchmark_filter_and_explain(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_and_explain");

    let dataset = generate_synthetic_cohort(1000);
    let criteria = FilterCriteria::new()
        .with_age_range(40.0, 70.0)
        .with_diagnosis_code("I10")
        .with_diagnosis_code("J44");

    group.bench_function("filter_1000", |b| {
        b.iter(|| filter::apply(black_box(&dataset.records), black_box(&criteria)));
    });

    let outcome = CoxModel::new()
        .with_penalizer(0.01)
        .fit_cohort(&dataset.records, &medsurvive::Covariate::ALL);
    group.bench_function("explain_1000", |b| {
        b.iter(|| explain(black_box(&outcome), black_box(&dataset.records)));
    });

    let data = generate_synthetic_data(300, 8);
    let risk_scores = CoxModel::new()
        .fit(&data)
        .unwrap()
        .predict_log_partial_hazard(data.covariates())
        .unwrap();
    group.bench_function("harrell_c_index", |b| {
        b.iter(|| {
            metrics::harrell_c_index(
                black_box(risk_scores.view()),
                black_box(data.times()),
                black_box(data.events()),
            )
            .unwrap()
        });
    });

    group.finish();
}

fn benchmark_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    for &n_patients in [100, 500, 2000].iter() {
        let dataset = generate_synthetic_cohort(n_patients);
        let config = PipelineConfig::new().with_group_by(GroupBy::Sex).with_penalizer(0.01);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_patients", n_patients)),
            &dataset,
            |b, dataset| {
                b.iter(|| pipeline::run(black_box(dataset), &config).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_cox_fitting,
    benchmark_penalizer,
    benchmark_kaplan_meier,
    benchmark_filter_and_explain,
    benchmark_full_pipeline
);
criterion_main!(benches);
