#[cfg(test)]
mod property_tests {
    use gridrl::converter::{ActionConverter, ConverterParam};
    use gridrl::env::{GridDescriptor, GridEnv, ToyCase5};
    use gridrl::params::{NnParam, TrainingParam};
    use gridrl::replay_buffer::{EpisodeBuffer, Experience, ReplayBuffer};
    use ndarray::array;
    use proptest::prelude::*;

    // Strategy for generating valid grid descriptors
    fn descriptor_strategy() -> impl Strategy<Value = GridDescriptor> {
        (1usize..=5, 1usize..=5, 1usize..=12, 2usize..=6).prop_map(
            |(n_gen, n_load, n_line, n_sub)| GridDescriptor {
                n_gen,
                n_load,
                n_line,
                n_sub,
            },
        )
    }

    fn experience(tag: f32, done: bool) -> Experience {
        Experience {
            state: array![tag],
            action: 0,
            reward: tag,
            next_state: array![tag + 1.0],
            done,
        }
    }

    proptest! {
        #[test]
        fn test_catalogue_size_closed_forms(descriptor in descriptor_strategy()) {
            let lines = ActionConverter::new(
                &descriptor,
                &ConverterParam { set_line_status: true, ..Default::default() },
            );
            prop_assert_eq!(lines.n_actions(), 1 + 2 * descriptor.n_line);

            let bus = ActionConverter::new(
                &descriptor,
                &ConverterParam { change_bus_vect: true, ..Default::default() },
            );
            prop_assert_eq!(bus.n_actions(), 1 + descriptor.dim_topo());

            let topo = ActionConverter::new(
                &descriptor,
                &ConverterParam { set_topo_vect: true, ..Default::default() },
            );
            prop_assert_eq!(topo.n_actions(), 1 + 2 * descriptor.dim_topo());
        }

        #[test]
        fn test_every_catalogue_index_decodes(
            descriptor in descriptor_strategy(),
            set_line_status in any::<bool>(),
            change_bus_vect in any::<bool>(),
            set_topo_vect in any::<bool>(),
        ) {
            let param = ConverterParam { set_line_status, change_bus_vect, set_topo_vect };
            let converter = ActionConverter::new(&descriptor, &param);
            prop_assert!(converter.n_actions() >= 1);
            for encoded in 0..converter.n_actions() {
                prop_assert!(converter.to_grid_action(encoded).is_ok());
            }
            prop_assert!(converter.to_grid_action(converter.n_actions()).is_err());
        }

        #[test]
        fn test_replay_buffer_never_exceeds_capacity(
            capacity in 1usize..=64,
            n_items in 0usize..=200,
        ) {
            let mut buffer = ReplayBuffer::new(capacity);
            for i in 0..n_items {
                buffer.add(experience(i as f32, false));
                prop_assert!(buffer.len() <= capacity);
            }
            prop_assert_eq!(buffer.len(), n_items.min(capacity));
        }

        #[test]
        fn test_replay_buffer_sample_size_is_bounded(
            capacity in 1usize..=64,
            n_items in 0usize..=100,
            batch_size in 0usize..=100,
        ) {
            let mut buffer = ReplayBuffer::new(capacity);
            for i in 0..n_items {
                buffer.add(experience(i as f32, false));
            }
            let batch = buffer.sample(batch_size);
            prop_assert_eq!(batch.len(), batch_size.min(buffer.len()));
        }

        #[test]
        fn test_episode_buffer_bounded_after_episode_end(
            capacity in 1usize..=50,
            episode_lens in prop::collection::vec(1usize..=20, 1..=10),
        ) {
            let mut buffer = EpisodeBuffer::new(capacity);
            let mut tag = 0.0;
            for len in episode_lens {
                for i in 0..len {
                    buffer.push(experience(tag, i == len - 1));
                    tag += 1.0;
                }
                // whole-episode eviction keeps completed storage within capacity
                prop_assert!(buffer.len() <= capacity);
            }
        }

        #[test]
        fn test_episode_traces_have_exact_length(
            trace_len in 1usize..=8,
            episode_len in 1usize..=30,
        ) {
            let mut buffer = EpisodeBuffer::new(1000);
            for i in 0..episode_len {
                buffer.push(experience(i as f32, false));
            }
            let traces = buffer.sample_traces(16, trace_len);
            if episode_len >= trace_len {
                prop_assert_eq!(traces.len(), 16);
                for trace in traces {
                    prop_assert_eq!(trace.len(), trace_len);
                    for pair in trace.windows(2) {
                        prop_assert!((pair[1].reward - pair[0].reward - 1.0).abs() < 1e-6);
                    }
                }
            } else {
                prop_assert!(traces.is_empty());
            }
        }

        #[test]
        fn test_epsilon_schedule_stays_within_bounds(
            initial in 0.05f32..1.0,
            final_ratio in 0.01f32..0.9,
            horizon in 1usize..=100_000,
            probe in 0usize..=200_000,
        ) {
            let param = TrainingParam {
                initial_epsilon: initial,
                final_epsilon: initial * final_ratio,
                step_for_final_epsilon: horizon,
                ..Default::default()
            };
            let eps = param.epsilon(probe);
            prop_assert!(eps >= param.final_epsilon - 1e-6);
            prop_assert!(eps <= param.initial_epsilon + 1e-6);
            // never increases as training advances
            let later = param.epsilon(probe + horizon / 2 + 1);
            prop_assert!(later <= eps + 1e-6);
        }

        #[test]
        fn test_obs_size_matches_extracted_vector(
            attrs in prop::sample::subsequence(
                vec![
                    "prod_p".to_string(),
                    "load_p".to_string(),
                    "rho".to_string(),
                    "line_status".to_string(),
                    "topo_vect".to_string(),
                ],
                1..=5,
            )
        ) {
            let mut env = ToyCase5::seeded(99);
            let expected = NnParam::get_obs_size(&env, &attrs).unwrap();
            let obs = env.reset();
            let flat = obs.extract(&attrs).unwrap();
            prop_assert_eq!(flat.len(), expected);

            let mut by_attr = 0;
            for attr in &attrs {
                by_attr += env.descriptor().attr_dim(attr).unwrap();
            }
            prop_assert_eq!(expected, by_attr);
        }
    }
}
