#[cfg(test)]
mod tests {
    use crate::{
        config::{DetectorConfig, OptimConfig},
        dataset::DatasetConfig,
        error::ResVitError,
        models::{BottleneckConfig, EncDecConfig},
    };

    fn valid_config() -> DetectorConfig {
        let dataset = DatasetConfig::new("data".into());
        DetectorConfig::new(
            EncDecConfig::new(1),
            BottleneckConfig::new(),
            "pretrain.json".into(),
            dataset.clone(),
            dataset.clone(),
            dataset,
            OptimConfig::new(1e-4, [0.9, 0.999], 1e-2),
        )
    }

    fn expect_invalid(config: &DetectorConfig, needle: &str) {
        match config.validate() {
            Err(ResVitError::InvalidConfiguration { reason }) => {
                assert!(reason.contains(needle), "`{reason}` does not mention `{needle}`");
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_configuration() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_non_positive_learning_rate() {
        let mut config = valid_config();
        config.optim = OptimConfig::new(0.0, [0.9, 0.999], 0.0);
        expect_invalid(&config, "optim.lr");
    }

    #[test]
    fn test_beta_out_of_range() {
        let mut config = valid_config();
        config.optim = OptimConfig::new(1e-3, [0.9, 1.0], 0.0);
        expect_invalid(&config, "optim.betas");
    }

    #[test]
    fn test_negative_weight_decay() {
        let mut config = valid_config();
        config.optim = OptimConfig::new(1e-3, [0.9, 0.999], -1.0);
        expect_invalid(&config, "optim.weight_decay");
    }

    #[test]
    fn test_heads_must_divide_bottleneck_width() {
        let mut config = valid_config();
        // 16 << 3 = 128 channels at the bottleneck.
        config.bottleneck = BottleneckConfig::new().with_num_heads(3);
        expect_invalid(&config, "num_heads");
    }

    #[test]
    fn test_dataset_channels_must_match_input_channels() {
        let mut config = valid_config();
        config.validation_dataset = DatasetConfig::new("data".into()).with_channels(3);
        expect_invalid(&config, "validation_dataset.channels");
    }

    #[test]
    fn test_missing_section_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detector.json");
        std::fs::write(
            &path,
            r#"{
                "enc_dec": {"in_channels": 1},
                "bottleneck": {},
                "pretrain": "",
                "train_dataset": {"root": "data"},
                "validation_dataset": {"root": "data"},
                "test_dataset": {"root": "data"}
            }"#,
        )
        .unwrap();

        assert!(matches!(
            DetectorConfig::from_file(&path),
            Err(ResVitError::ConfigLoad { .. })
        ));
    }

    #[test]
    fn test_saved_configuration_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detector.json");
        let config = valid_config();
        burn::config::Config::save(&config, &path).unwrap();

        let loaded = DetectorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.optim.betas, [0.9, 0.999]);
        assert_eq!(loaded.enc_dec.depth, config.enc_dec.depth);
    }
}
