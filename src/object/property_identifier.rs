use crate::custom_range_enum;

custom_range_enum! {
    /// The property identifiers this crate reads or decodes.
    ///
    /// Anything else still round-trips through `Custom` (512 and up) or
    /// `Reserved`, which matters for COV notifications that carry arbitrary
    /// properties.
    PropertyIdentifier {
        Description = 28,
        FirmwareRevision = 44,
        MaxApduLengthAccepted = 62,
        ModelName = 70,
        ObjectIdentifier = 75,
        ObjectList = 76,
        ObjectName = 77,
        ObjectType = 79,
        PresentValue = 85,
        ProtocolServicesSupported = 97,
        SegmentationSupported = 107,
        StatusFlags = 111,
        SystemStatus = 112,
        Units = 117,
        VendorIdentifier = 120,
        VendorName = 121,
        StructuredObjectList = 209,
        PropertyList = 371,
    },
    u32,
    512..=4194303
}
