use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bacnet_recon::enumerate::dedup_objects;
use bacnet_recon::object::{ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyValue};
use bacnet_recon::service::{PropertyResult, ReadAccessResult, ReadPropertyAck, ReadPropertyMultipleAck};

fn object_list(count: u32) -> Vec<ObjectIdentifier> {
    std::iter::once(ObjectIdentifier::device(1))
        .chain((1..count).map(|i| ObjectIdentifier::new(ObjectType::AnalogValue, i)))
        .collect()
}

fn decode_benchmark(c: &mut Criterion) {
    let objects = object_list(500);
    let values: Vec<PropertyValue> = objects
        .iter()
        .copied()
        .map(PropertyValue::ObjectIdentifier)
        .collect();

    let mut read_ack = Vec::new();
    ReadPropertyAck {
        object_identifier: ObjectIdentifier::device(1),
        property_identifier: PropertyIdentifier::ObjectList,
        property_array_index: None,
        values: values.clone(),
    }
    .encode(&mut read_ack);
    c.bench_function("decode_object_list_ack_500", |b| {
        b.iter(|| ReadPropertyAck::decode(black_box(&read_ack)))
    });

    let mut multiple_ack = Vec::new();
    ReadPropertyMultipleAck {
        results: vec![ReadAccessResult {
            object_identifier: ObjectIdentifier::device(1),
            results: vec![PropertyResult {
                property_identifier: PropertyIdentifier::ObjectList,
                property_array_index: None,
                value: Ok(values),
            }],
        }],
    }
    .encode(&mut multiple_ack);
    c.bench_function("decode_object_list_rpm_ack_500", |b| {
        b.iter(|| ReadPropertyMultipleAck::decode(black_box(&multiple_ack)))
    });
}

fn dedup_benchmark(c: &mut Criterion) {
    let mut objects = object_list(500);
    objects.extend(object_list(250));
    c.bench_function("dedup_objects_750", |b| {
        b.iter(|| dedup_objects(black_box(objects.clone())))
    });
}

criterion_group!(benches, decode_benchmark, dedup_benchmark);
criterion_main!(benches);
