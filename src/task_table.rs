// Task table: trains reconstructors where requested and scores them on test data

use crate::dataset::{DataPairs, Dataset, Part};
use crate::error::{RecoError, Result};
use crate::metrics::Measure;
use crate::reconstructor::{LearnedReconstructor, Reconstructor};
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// a reconstructor as the task table sees it. Only learned reconstructors can be trained and
/// take hyper parameter choices.
pub enum TaskReconstructor {
    Fixed(Box<dyn Reconstructor>),
    Learned(Box<dyn LearnedReconstructor>),
}

impl TaskReconstructor {
    fn as_reconstructor(&self) -> &dyn Reconstructor {
        match self {
            TaskReconstructor::Fixed(r) => r.as_ref(),
            TaskReconstructor::Learned(r) => r as &dyn Reconstructor,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    pub skip_training: bool,
}

pub struct Task<'a> {
    reconstructor: TaskReconstructor,
    measures: Vec<Measure>,
    test_data: DataPairs,
    dataset: Option<&'a dyn Dataset>,
    hyper_param_choices: Vec<toml::Table>,
    options: TaskOptions,
}

impl<'a> Task<'a> {
    pub fn new(reconstructor: TaskReconstructor, measures: &[Measure], test_data: DataPairs) -> Self {
        Self {
            reconstructor,
            measures: measures.to_vec(),
            test_data,
            dataset: None,
            hyper_param_choices: vec![],
            options: TaskOptions::default(),
        }
    }

    /// dataset used for training
    pub fn with_dataset(mut self, dataset: &'a dyn Dataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// every choice runs as its own sub-task
    pub fn with_hyper_param_choices(mut self, choices: Vec<toml::Table>) -> Self {
        self.hyper_param_choices = choices;
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: usize,
    pub sub_task: usize,
    pub reconstructor: String,
    /// per-sample values of every measure
    pub measure_values: BTreeMap<String, Vec<f64>>,
    pub hyper_params: BTreeMap<String, String>,
    pub misc: BTreeMap<String, String>,
}

impl TaskResult {
    pub fn mean(&self, measure: &str) -> Option<f64> {
        let v = self.measure_values.get(measure)?;
        if v.is_empty() {
            return None;
        }
        Some(v.iter().sum::<f64>() / v.len() as f64)
    }

    /// population standard deviation
    pub fn std(&self, measure: &str) -> Option<f64> {
        let m = self.mean(measure)?;
        let v = &self.measure_values[measure];
        Some((v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64).sqrt())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultTable {
    pub results: Vec<TaskResult>,
}

impl ResultTable {
    /// renders one row per sub-task with mean and std of every measure. `show_columns` adds
    /// the `misc` and/or `hyper_params` columns.
    pub fn render(&self, show_columns: &[&str]) -> String {
        let measures = self.results.iter()
            .flat_map(|r| r.measure_values.keys().cloned())
            .collect::<std::collections::BTreeSet<String>>();

        let mut header = vec!["task".to_string(), "sub_task".to_string(), "reconstructor".to_string()];
        measures.iter().for_each(|m| {
            header.push(format!("{}_mean", m));
            header.push(format!("{}_std", m));
        });
        let extra = show_columns.iter().filter(|c| match **c {
            "misc" | "hyper_params" => true,
            other => {
                warn!("unknown result column '{}'", other);
                false
            }
        }).collect::<Vec<_>>();
        extra.iter().for_each(|c| header.push(c.to_string()));

        let rows = self.results.iter().map(|r| {
            let mut row = vec![r.task.to_string(), r.sub_task.to_string(), r.reconstructor.clone()];
            measures.iter().for_each(|m| {
                row.push(r.mean(m).map_or("-".to_string(), |v| format!("{:.4}", v)));
                row.push(r.std(m).map_or("-".to_string(), |v| format!("{:.4}", v)));
            });
            extra.iter().for_each(|c| {
                let map = if **c == "misc" { &r.misc } else { &r.hyper_params };
                row.push(map.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(", "));
            });
            row
        }).collect::<Vec<_>>();

        let widths = (0..header.len()).map(|c| {
            rows.iter().map(|r| r[c].len()).chain([header[c].len()]).max().unwrap_or(0)
        }).collect::<Vec<_>>();

        std::iter::once(&header).chain(rows.iter()).map(|row| {
            let line = row.iter().zip(&widths).map(|(cell, w)| format!("{:<w$}", cell, w = *w)).collect::<Vec<_>>();
            format!("{}\n", line.join("  ").trim_end())
        }).collect()
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct TaskTable<'a> {
    tasks: Vec<Task<'a>>,
    results: ResultTable,
}

impl<'a> TaskTable<'a> {
    pub fn new() -> Self {
        Self {
            tasks: vec![],
            results: ResultTable::default(),
        }
    }

    pub fn append(&mut self, task: Task<'a>) {
        self.tasks.push(task);
    }

    pub fn results(&self) -> &ResultTable {
        &self.results
    }

    /// the reconstructor of a task, e.g. to inspect it after training
    pub fn reconstructor(&self, task: usize) -> Option<&TaskReconstructor> {
        self.tasks.get(task).map(|t| &t.reconstructor)
    }

    /// runs every task and sub-task. Any failure aborts the run.
    pub fn run(&mut self) -> Result<&ResultTable> {
        let mut results = Vec::new();
        for (t_idx, task) in self.tasks.iter_mut().enumerate() {
            let choices = if task.hyper_param_choices.is_empty() {
                vec![None]
            } else {
                task.hyper_param_choices.iter().map(Some).collect()
            };
            for (s_idx, choice) in choices.into_iter().enumerate() {
                info!("running task {} sub-task {} ...", t_idx, s_idx);
                let mut hyper_params = BTreeMap::new();
                match &mut task.reconstructor {
                    TaskReconstructor::Learned(r) => {
                        if let Some(choice) = choice {
                            r.apply_hyper_params(choice)?;
                        }
                        r.hyper_params_table()?.iter().for_each(|(k, v)| {
                            hyper_params.insert(k.clone(), v.to_string());
                        });
                        if !task.options.skip_training {
                            let dataset = task.dataset.ok_or(RecoError::EmptyDataset(Part::Train))?;
                            let now = Instant::now();
                            r.train(dataset)?;
                            info!("training took {:.01} s", now.elapsed().as_secs_f32());
                        }
                    }
                    TaskReconstructor::Fixed(r) => {
                        if choice.is_some() {
                            warn!("'{}' has no hyper parameters, ignoring choice", r.name());
                        }
                    }
                }

                let measure_values = evaluate(task.reconstructor.as_reconstructor(), &task.measures, &task.test_data)?;
                let mut misc = BTreeMap::new();
                misc.insert("n_test".to_string(), task.test_data.len().to_string());
                misc.insert("skip_training".to_string(), task.options.skip_training.to_string());
                if let Some(ds) = task.dataset {
                    misc.insert("train_len".to_string(), ds.get_len(Part::Train).to_string());
                }

                results.push(TaskResult {
                    task: t_idx,
                    sub_task: s_idx,
                    reconstructor: task.reconstructor.as_reconstructor().name().to_string(),
                    measure_values,
                    hyper_params,
                    misc,
                });
            }
        }
        self.results = ResultTable { results };
        Ok(&self.results)
    }
}

/// reconstructs every test observation in parallel and scores it with every measure
fn evaluate(reconstructor: &dyn Reconstructor, measures: &[Measure], test_data: &DataPairs) -> Result<BTreeMap<String, Vec<f64>>> {
    let now = Instant::now();
    let scores = test_data.observations.par_iter().zip(test_data.ground_truths.par_iter()).map(|(y, gt)| {
        let x = reconstructor.reconstruct(y)?;
        measures.iter().map(|m| m.apply(&x, gt)).collect::<Result<Vec<f64>>>()
    }).collect::<Result<Vec<_>>>()?;
    info!("evaluated {} samples in {:.01} s", test_data.len(), now.elapsed().as_secs_f32());

    Ok(measures.iter().enumerate().map(|(i, m)| {
        (m.name().to_string(), scores.iter().map(|s| s[i]).collect())
    }).collect())
}
