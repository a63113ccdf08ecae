use gamrt::{
    DataChannelRegistry, DataDefinition, GamDefinitions, ReaderBroker, TypeRegistry, WriterBroker,
};
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #[test]
    fn verify_fails_iff_a_state_has_two_producers(
        // For each GAM: the state it runs in and whether it produces or consumes.
        gams in proptest::collection::vec((0usize..3, any::<bool>()), 1..8),
    ) {
        let mut registry = DataChannelRegistry::new(Arc::new(TypeRegistry::new()));
        let mut producers = [0u32; 3];
        for (i, (state, produces)) in gams.iter().enumerate() {
            let definition = DataDefinition::leaf("X", "uint32", "DDB1.X", "0");
            let gam = GamDefinitions::new(format!("G{i}"), [format!("s{state}")]);
            let gam = if *produces {
                producers[*state] += 1;
                gam.with_output(definition)
            } else {
                gam.with_input(definition)
            };
            registry.add_data_definition(&gam).unwrap();
        }
        let violated = producers.iter().any(|n| *n > 1);
        prop_assert_eq!(registry.verify().is_err(), violated);
    }

    #[test]
    fn write_then_read_round_trips(
        values in proptest::collection::vec(any::<u16>(), 3),
        buffer in 0usize..4,
    ) {
        let mut registry = DataChannelRegistry::new(Arc::new(TypeRegistry::new()));
        let definition = DataDefinition::leaf("V", "uint16", "DDB1.V", "").with_shape(vec![3]);
        registry
            .add_data_definition(&GamDefinitions::new("W", ["s"]).with_output(definition.clone()))
            .unwrap();
        registry.verify().unwrap();
        let table = registry.allocate().unwrap();

        let mut writer = WriterBroker::with_registry(Arc::clone(&table));
        let mut reader = ReaderBroker::with_registry(table);
        writer.add_variable(&definition, None).unwrap();
        reader.add_variable(&definition, None).unwrap();
        writer.finalise().unwrap();
        reader.finalise().unwrap();

        let out = writer.data(0).unwrap();
        for (i, v) in values.iter().enumerate() {
            out.set(i, *v).unwrap();
        }
        writer.write(buffer).unwrap();
        reader.read(buffer).unwrap();
        let seen: Vec<u16> = (0..3).map(|i| reader.data(0).unwrap().get(i).unwrap()).collect();
        prop_assert_eq!(seen, values);
    }
}
