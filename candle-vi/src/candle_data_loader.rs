use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rayon::prelude::*;
use std::collections::BTreeMap;

pub struct MinibatchData {
    pub input: Tensor,
    pub output: Option<Tensor>,
    /// label per sample (n,) `u32`
    pub labels: Option<Tensor>,
    /// sample ids (n,) `u32`, stable across subsets and shuffles
    pub samples: Tensor,
}

impl MinibatchData {
    /// what the likelihood should be evaluated against
    pub fn target(&self) -> &Tensor {
        self.output.as_ref().unwrap_or(&self.input)
    }

    pub fn num_samples(&self) -> candle_core::Result<usize> {
        self.input.dim(0)
    }
}

/// `DataLoader` for minibatch learning
///
/// An epoch calls `shuffle_minibatch` once and then reads
/// `minibatch_data(b)` for `b in 0..num_minibatch()`; the split is
/// exhausted after the last index.
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// number of samples visited in one epoch
    fn num_samples(&self) -> usize;

    /// ids of every sample this loader can serve
    fn sample_ids(&self) -> &[u32];

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()>;

    /// Redraw a label-stratified subsample for the next epoch
    fn resample_labels(&mut self, _rng: &mut StdRng) -> anyhow::Result<()> {
        Ok(())
    }
}

/// lets a trainer run over a loader the caller keeps
impl<D> DataLoader for &mut D
where
    D: DataLoader + ?Sized,
{
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        (**self).minibatch_data(batch_idx, target_device)
    }

    fn num_minibatch(&self) -> usize {
        (**self).num_minibatch()
    }

    fn num_samples(&self) -> usize {
        (**self).num_samples()
    }

    fn sample_ids(&self) -> &[u32] {
        (**self).sample_ids()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        (**self).shuffle_minibatch(batch_size, rng)
    }

    fn resample_labels(&mut self, rng: &mut StdRng) -> anyhow::Result<()> {
        (**self).resample_labels(rng)
    }
}

/// train/validation/test splits handed to a trainer
pub struct DataSplits<D> {
    pub train: D,
    pub validation: Option<D>,
    pub test: Option<D>,
}

impl<D> DataSplits<D> {
    pub fn train_only(train: D) -> Self {
        Self {
            train,
            validation: None,
            test: None,
        }
    }

    pub fn with_validation(train: D, validation: D) -> Self {
        Self {
            train,
            validation: Some(validation),
            test: None,
        }
    }
}

/// Per-epoch label-balanced subsampling
#[derive(Debug, Clone, Copy)]
pub struct LabelSubsampling {
    /// draw at most this many samples of each label
    pub n_samples_per_label: usize,
    /// samples carrying this label are always kept
    pub unlabeled: Option<u32>,
}

///
/// A simple data loader for in-memory 2d matrix.  Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    output_data: Option<Vec<Tensor>>,
    labels: Option<Vec<u32>>,
    sample_ids: Vec<u32>,
    subsampling: Option<LabelSubsampling>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_output_data: Option<Vec<Tensor>>,
    shuffled_labels: Option<Vec<Tensor>>,
    shuffled_samples: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input_data = data.rows_to_tensor_vec()?;
        let nrows = input_data.len();
        Ok(Self::from_parts(
            input_data,
            None,
            None,
            (0..nrows as u32).collect(),
        ))
    }

    ///
    /// Create a data loader with the main `data` and output `out`
    ///
    pub fn new_with_output<D>(data: &D, out: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input_data = data.rows_to_tensor_vec()?;
        let output_data = out.rows_to_tensor_vec()?;

        if input_data.len() != output_data.len() {
            return Err(anyhow::anyhow!(
                "input rows {} vs. output rows {}",
                input_data.len(),
                output_data.len()
            ));
        }

        let nrows = input_data.len();
        Ok(Self::from_parts(
            input_data,
            Some(output_data),
            None,
            (0..nrows as u32).collect(),
        ))
    }

    /// Attach a label to each row
    pub fn with_labels(mut self, labels: Vec<u32>) -> anyhow::Result<Self> {
        if labels.len() != self.input_data.len() {
            return Err(anyhow::anyhow!(
                "{} labels for {} rows",
                labels.len(),
                self.input_data.len()
            ));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// Enable label-stratified resampling (needs labels)
    pub fn with_label_subsampling(mut self, subsampling: LabelSubsampling) -> anyhow::Result<Self> {
        if self.labels.is_none() {
            return Err(anyhow::anyhow!("label subsampling requires labels"));
        }
        if subsampling.n_samples_per_label == 0 {
            return Err(anyhow::anyhow!("n_samples_per_label must be positive"));
        }
        self.subsampling = Some(subsampling);
        Ok(self)
    }

    fn from_parts(
        input_data: Vec<Tensor>,
        output_data: Option<Vec<Tensor>>,
        labels: Option<Vec<u32>>,
        sample_ids: Vec<u32>,
    ) -> Self {
        let rows = (0..input_data.len()).collect();
        InMemoryData {
            input_data,
            output_data,
            labels,
            sample_ids,
            subsampling: None,
            shuffled_input_data: None,
            shuffled_output_data: None,
            shuffled_labels: None,
            shuffled_samples: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        }
    }

    pub fn num_rows(&self) -> usize {
        self.input_data.len()
    }

    pub fn labels(&self) -> Option<&[u32]> {
        self.labels.as_deref()
    }

    /// Rows currently drawn each epoch (row positions, not sample ids)
    pub fn active_rows(&self) -> &[usize] {
        &self.minibatches.samples
    }

    /// A new loader over the given row positions; sample ids, labels and
    /// the subsampling setting carry over
    pub fn subset(&self, rows: &[usize]) -> anyhow::Result<Self> {
        let nrows = self.num_rows();
        if let Some(&bad) = rows.iter().find(|&&r| r >= nrows) {
            return Err(anyhow::anyhow!("invalid row = {} vs. total # = {}", bad, nrows));
        }

        let input_data = rows.iter().map(|&r| self.input_data[r].clone()).collect();
        let output_data = self
            .output_data
            .as_ref()
            .map(|out| rows.iter().map(|&r| out[r].clone()).collect());
        let labels = self
            .labels
            .as_ref()
            .map(|lab| rows.iter().map(|&r| lab[r]).collect());
        let sample_ids = rows.iter().map(|&r| self.sample_ids[r]).collect();

        let mut ret = Self::from_parts(input_data, output_data, labels, sample_ids);
        ret.subsampling = self.subsampling;
        Ok(ret)
    }

    ///
    /// Randomly split rows into a training and a validation loader.
    /// `ceil(train_size * n)` rows go to training; with
    /// `train_size == 1` there is no validation split.
    ///
    pub fn split(self, train_size: f64, rng: &mut StdRng) -> anyhow::Result<DataSplits<Self>> {
        if !(train_size > 0.0 && train_size <= 1.0) {
            return Err(anyhow::anyhow!(
                "train_size must be in (0, 1], got {}",
                train_size
            ));
        }

        let nrows = self.num_rows();
        let n_train = ((train_size * nrows as f64).ceil() as usize).min(nrows);

        if n_train == nrows {
            return Ok(DataSplits::train_only(self));
        }

        let mut rows: Vec<usize> = (0..nrows).collect();
        rows.shuffle(rng);
        let (train_rows, valid_rows) = rows.split_at(n_train);

        Ok(DataSplits::with_validation(
            self.subset(train_rows)?,
            self.subset(valid_rows)?,
        ))
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let output =
                take_shuffled(batch_idx, target_device, self.shuffled_output_data.as_ref())?;
            let labels = take_shuffled(batch_idx, target_device, self.shuffled_labels.as_ref())?;
            let samples = take_shuffled(batch_idx, target_device, self.shuffled_samples.as_ref())?
                .ok_or_else(|| anyhow::anyhow!("missing sample ids"))?;

            Ok(MinibatchData {
                input,
                output,
                labels,
                samples,
            })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn sample_ids(&self) -> &[u32] {
        &self.sample_ids
    }

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size, rng)?;

        let mut shuffled_input = vec![];
        let mut shuffled_output = self.output_data.as_ref().map(|_| vec![]);
        let mut shuffled_labels = self.labels.as_ref().map(|_| vec![]);
        let mut shuffled_samples = vec![];

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        for rows in self.minibatches.chunks.iter() {
            let chunk: Vec<Tensor> = rows.iter().map(|&i| self.input_data[i].clone()).collect();
            shuffled_input.push(Tensor::cat(&chunk, 0)?);

            if let (Some(out_data), Some(shuffled)) =
                (self.output_data.as_ref(), shuffled_output.as_mut())
            {
                let chunk: Vec<Tensor> = rows.iter().map(|&i| out_data[i].clone()).collect();
                shuffled.push(Tensor::cat(&chunk, 0)?);
            }

            if let (Some(labels), Some(shuffled)) = (self.labels.as_ref(), shuffled_labels.as_mut())
            {
                let chunk: Vec<u32> = rows.iter().map(|&i| labels[i]).collect();
                shuffled.push(Tensor::from_vec(chunk, rows.len(), &Device::Cpu)?);
            }

            let ids: Vec<u32> = rows.iter().map(|&i| self.sample_ids[i]).collect();
            shuffled_samples.push(Tensor::from_vec(ids, rows.len(), &Device::Cpu)?);
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_output_data = shuffled_output;
        self.shuffled_labels = shuffled_labels;
        self.shuffled_samples = Some(shuffled_samples);

        Ok(())
    }

    fn resample_labels(&mut self, rng: &mut StdRng) -> anyhow::Result<()> {
        let (Some(labels), Some(subsampling)) = (self.labels.as_ref(), self.subsampling) else {
            return Ok(());
        };

        let mut rows_by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (row, &lab) in labels.iter().enumerate() {
            rows_by_label.entry(lab).or_default().push(row);
        }

        let mut active = vec![];
        for (lab, rows) in rows_by_label {
            if Some(lab) == subsampling.unlabeled || rows.len() <= subsampling.n_samples_per_label
            {
                active.extend(rows);
            } else {
                active.extend(
                    rows.choose_multiple(rng, subsampling.n_samples_per_label)
                        .copied(),
                );
            }
        }
        active.sort_unstable();

        self.minibatches.samples = active;
        self.minibatches.chunks.clear();
        self.shuffled_input_data = None;
        self.shuffled_output_data = None;
        self.shuffled_labels = None;
        self.shuffled_samples = None;
        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition the
/// active rows in `samples`.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }
        let mut order = self.samples.clone();
        order.shuffle(rng);
        self.chunks = order.chunks(batch_size).map(|c| c.to_vec()).collect();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)?
                    .reshape((1, row.len()))?;
                Ok((i, v))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        idx_data.sort_by_key(|(i, _)| *i);
        Ok(idx_data.into_iter().map(|(_, t)| t).collect())
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        (0..self.dim(0)?).map(|i| self.narrow(0, i, 1)).collect()
    }
}
