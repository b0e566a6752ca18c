use anyhow::Result;
use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::db::{Artifact, BiometricSample, ClassScore};

use super::{sampler::SampleSource, SourceKind, TaskTag};

/// Camera frames fed to the classifier.
pub trait CameraSource: Send + 'static {
    fn open(&mut self) -> Result<()>;

    fn grab(&mut self) -> Result<RgbImage>;
}

/// Raw classifier output, scores in the classifier's own scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub scores: Vec<ClassScore>,
    pub dominant_label: Option<String>,
    pub face_confidence: Option<f64>,
    pub age: Option<f64>,
    pub gender: Option<String>,
}

/// Opaque per-frame classifier. `Ok(None)` means nothing classifiable was in
/// the frame.
pub trait BiometricClassifier: Send + 'static {
    fn classify(&mut self, frame: &RgbImage) -> Result<Option<Classification>>;
}

/// Maps one raw score into [0, 1]. NaN and infinities map to 0.
pub fn normalize_score(raw: f64, scale: f64) -> f64 {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let value = raw / scale;
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Normalizes every score, then rescales the set to sum to 1 if it sums to
/// more.
pub fn normalize_distribution(scores: &[ClassScore], scale: f64) -> Vec<ClassScore> {
    let mut normalized: Vec<ClassScore> = scores
        .iter()
        .map(|entry| ClassScore {
            label: entry.label.clone(),
            score: normalize_score(entry.score, scale),
        })
        .collect();

    let total: f64 = normalized.iter().map(|entry| entry.score).sum();
    if total > 1.0 {
        for entry in &mut normalized {
            entry.score /= total;
        }
    }
    normalized
}

fn clamp_unit(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 1.0))
}

/// Polls the camera, classifies each frame and emits one sample per poll.
pub struct BiometricSampler {
    camera: Box<dyn CameraSource>,
    classifier: Box<dyn BiometricClassifier>,
    session_id: i64,
    task_tag: TaskTag,
    score_scale: f64,
}

impl BiometricSampler {
    pub fn new(
        camera: Box<dyn CameraSource>,
        classifier: Box<dyn BiometricClassifier>,
        session_id: i64,
        task_tag: TaskTag,
        score_scale: f64,
    ) -> Self {
        Self {
            camera,
            classifier,
            session_id,
            task_tag,
            score_scale,
        }
    }

    pub fn to_sample(&self, raw: Classification, timestamp: DateTime<Utc>) -> BiometricSample {
        let scores = normalize_distribution(&raw.scores, self.score_scale);
        let dominant_label = raw
            .dominant_label
            .filter(|label| !label.is_empty())
            .or_else(|| {
                scores
                    .iter()
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                    .map(|entry| entry.label.clone())
            })
            .unwrap_or_else(|| "unknown".to_string());

        BiometricSample {
            session_id: self.session_id,
            timestamp,
            scores,
            dominant_label,
            face_confidence: clamp_unit(raw.face_confidence),
            age: raw.age.filter(|age| age.is_finite() && *age >= 0.0),
            gender: raw.gender,
            task_tag: self.task_tag.get(),
        }
    }
}

impl SampleSource for BiometricSampler {
    type Output = Artifact;

    fn kind(&self) -> SourceKind {
        SourceKind::Camera
    }

    fn open(&mut self) -> Result<()> {
        self.camera.open()
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let frame = self.camera.grab()?;
        let Some(raw) = self.classifier.classify(&frame)? else {
            return Ok(Vec::new());
        };
        Ok(vec![Artifact::Biometric(self.to_sample(raw, now))])
    }

    /// Every poll is already a complete sample; nothing is pending.
    fn finish(&mut self, _now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(label: &str, score: f64) -> ClassScore {
        ClassScore {
            label: label.into(),
            score,
        }
    }

    #[test]
    fn scores_are_scaled_and_clamped() {
        assert_eq!(normalize_score(0.0, 100.0), 0.0);
        assert_eq!(normalize_score(50.0, 100.0), 0.5);
        assert_eq!(normalize_score(100.0, 100.0), 1.0);
        assert_eq!(normalize_score(150.0, 100.0), 1.0);
        assert_eq!(normalize_score(-10.0, 100.0), 0.0);
        assert_eq!(normalize_score(f64::NAN, 100.0), 0.0);
        assert!((normalize_score(99.9, 100.0) - 0.999).abs() < 1e-12);
    }

    #[test]
    fn distribution_never_sums_above_one() {
        let scores = normalize_distribution(
            &[score("happy", 90.0), score("sad", 60.0), score("angry", 50.0)],
            100.0,
        );
        let total: f64 = scores.iter().map(|entry| entry.score).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((scores[0].score - 0.45).abs() < 1e-12);

        let small = normalize_distribution(&[score("happy", 20.0), score("sad", 10.0)], 100.0);
        assert_eq!(small[0].score, 0.2);
        assert_eq!(small[1].score, 0.1);
    }

    struct NoCamera;

    impl CameraSource for NoCamera {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn grab(&mut self) -> Result<RgbImage> {
            Ok(RgbImage::new(4, 4))
        }
    }

    struct Fixed(Option<Classification>);

    impl BiometricClassifier for Fixed {
        fn classify(&mut self, _frame: &RgbImage) -> Result<Option<Classification>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn dominant_label_falls_back_to_highest_score() {
        let mut sampler = BiometricSampler::new(
            Box::new(NoCamera),
            Box::new(Fixed(Some(Classification {
                scores: vec![score("neutral", 30.0), score("happy", 70.0)],
                dominant_label: None,
                face_confidence: Some(1.7),
                age: Some(f64::NAN),
                gender: Some("Woman".into()),
            }))),
            5,
            TaskTag::new(),
            100.0,
        );

        let outputs = sampler.poll(Utc::now()).unwrap();
        let Artifact::Biometric(sample) = &outputs[0] else {
            panic!("expected biometric sample");
        };
        assert_eq!(sample.dominant_label, "happy");
        assert_eq!(sample.face_confidence, Some(1.0));
        assert_eq!(sample.age, None);
        assert_eq!(sample.session_id, 5);
    }

    #[test]
    fn frames_without_faces_emit_nothing() {
        let mut sampler = BiometricSampler::new(
            Box::new(NoCamera),
            Box::new(Fixed(None)),
            5,
            TaskTag::new(),
            100.0,
        );
        assert!(sampler.poll(Utc::now()).unwrap().is_empty());
    }
}
