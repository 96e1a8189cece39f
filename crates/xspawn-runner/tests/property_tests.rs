use proptest::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use xspawn_runner::{
    Arguments, CaptureBuffer, Configuration, Environment, Executable, InputMethod, OutputMethod,
    StringOrRawBytes,
};

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

proptest! {
    /// **Property 1: Text and raw bytes name the same value**
    #[test]
    fn prop_string_and_bytes_are_interchangeable(text in "\\PC*") {
        let as_text = StringOrRawBytes::from(text.as_str());
        let as_bytes = StringOrRawBytes::from(text.as_bytes().to_vec());
        prop_assert_eq!(&as_text, &as_bytes);
        prop_assert_eq!(hash_of(&as_text), hash_of(&as_bytes));
        prop_assert_eq!(as_bytes.as_str(), Some(text.as_str()));
    }

    /// **Property 2: Arguments are kept as discrete, ordered values**
    #[test]
    fn prop_arguments_preserve_order(args in proptest::collection::vec("\\PC*", 0..10)) {
        let arguments: Arguments = args.iter().map(String::as_str).collect();
        prop_assert_eq!(arguments.len(), args.len());
        for (kept, original) in arguments.values().iter().zip(&args) {
            prop_assert_eq!(kept.as_bytes(), original.as_bytes());
        }
        prop_assert!(arguments.executable_path_override().is_none());
    }

    /// **Property 3: Later environment updates win**
    #[test]
    fn prop_environment_updates_override(
        key in "[A-Z_][A-Z0-9_]{0,12}",
        first in "[a-z]{0,8}",
        second in "[a-z]{0,8}",
    ) {
        let env = Environment::inherit()
            .updating([(key.as_str(), first.as_str())])
            .updating([(key.as_str(), second.as_str())]);
        prop_assert_eq!(env.entries().len(), 1);
        prop_assert_eq!(
            env.entries().get(&StringOrRawBytes::from(key.as_str())),
            Some(&StringOrRawBytes::from(second.as_str()))
        );
    }

    /// **Property 4: Captured output never exceeds its limit**
    #[test]
    fn prop_capture_buffer_respects_limit(
        limit in 0usize..256,
        writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16),
    ) {
        let mut buffer = CaptureBuffer::new(limit);
        let mut expected = Vec::new();
        for chunk in &writes {
            buffer.write(chunk);
            expected.extend_from_slice(chunk);
        }
        prop_assert!(buffer.len() <= limit);
        prop_assert_eq!(buffer.was_truncated(), expected.len() > limit);
        expected.truncate(limit);
        prop_assert_eq!(buffer.as_bytes(), expected.as_slice());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// **Property 5: A child writing N bytes yields min(N, limit) bytes**
    #[test]
    fn prop_collected_output_is_bounded(written in 0usize..200_000, limit in 1usize..150_000) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(
            Configuration::new(Executable::named("head"))
                .with_arguments(["-c".to_string(), written.to_string(), "/dev/zero".to_string()])
                .collect(
                    InputMethod::no_input(),
                    OutputMethod::collect_with_limit(limit),
                    OutputMethod::discard(),
                ),
        ).unwrap();

        let stdout = result.standard_output.unwrap();
        prop_assert_eq!(stdout.len(), written.min(limit));
        prop_assert_eq!(result.stdout_truncated, written > limit);
    }
}
